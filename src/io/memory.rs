//! In-memory loopback transport.
//!
//! Publishers invoke subscriber callbacks synchronously on the publishing
//! thread, which gives tests and local drivers deterministic delivery order
//! per topic. Callbacks must therefore stay cheap: the runtime only copies
//! payloads into its bounded ingress queues.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use super::broker::{BrokerError, Publisher, SubscriberCallback, Subscription};

type SubscriberSlot = (u64, Arc<SubscriberCallback>);

/// Loopback broker: a topic registry of subscriber callbacks.
#[derive(Default)]
pub struct MemoryBroker {
    topics: Mutex<HashMap<String, Vec<SubscriberSlot>>>,
    next_id: AtomicU64,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn make_publisher(self: &Arc<Self>, topic: &str) -> Box<dyn Publisher> {
        Box::new(MemoryPublisher {
            broker: Arc::clone(self),
            topic: topic.to_string(),
        })
    }

    pub fn subscribe(
        self: &Arc<Self>,
        topic: &str,
        callback: SubscriberCallback,
    ) -> Box<dyn Subscription> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.topics
            .lock()
            .unwrap()
            .entry(topic.to_string())
            .or_default()
            .push((id, Arc::new(callback)));
        Box::new(MemorySubscription {
            broker: Arc::downgrade(self),
            topic: topic.to_string(),
            id,
        })
    }

    fn publish(&self, topic: &str, payload: &str) {
        // Snapshot the callbacks so delivery happens outside the registry
        // lock and subscribers may unsubscribe concurrently.
        let callbacks: Vec<Arc<SubscriberCallback>> = {
            let topics = self.topics.lock().unwrap();
            topics
                .get(topic)
                .map(|subs| subs.iter().map(|(_, cb)| Arc::clone(cb)).collect())
                .unwrap_or_default()
        };
        for callback in callbacks {
            callback(payload);
        }
    }

    fn unsubscribe(&self, topic: &str, id: u64) {
        let mut topics = self.topics.lock().unwrap();
        if let Some(subs) = topics.get_mut(topic) {
            subs.retain(|(sub_id, _)| *sub_id != id);
            if subs.is_empty() {
                topics.remove(topic);
            }
        }
    }
}

struct MemoryPublisher {
    broker: Arc<MemoryBroker>,
    topic: String,
}

impl Publisher for MemoryPublisher {
    fn put(&self, payload: &str) -> Result<(), BrokerError> {
        self.broker.publish(&self.topic, payload);
        Ok(())
    }
}

struct MemorySubscription {
    broker: Weak<MemoryBroker>,
    topic: String,
    id: u64,
}

impl Subscription for MemorySubscription {}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        if let Some(broker) = self.broker.upgrade() {
            broker.unsubscribe(&self.topic, self.id);
        }
    }
}
