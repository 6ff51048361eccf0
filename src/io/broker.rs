//! Pub/sub substrate abstraction.
//!
//! The runtime only ever sees [`BrokerAccess`]: a factory for publisher and
//! subscription handles on named topics. Handles own their registration and
//! release it on drop; nothing is explicitly destroyed at call sites.
//!
//! This crate ships the in-memory loopback transport. MQTT and Kafka are
//! external collaborators; their connection settings are still read from the
//! documented environment variables so a deployment can hand them to an
//! external connector.

use std::env;
use std::sync::Arc;

use thiserror::Error;

use super::memory::MemoryBroker;
use crate::error::{OperaError, Result};

/// Default topic names.
pub mod topics {
    pub const BODY_PRESENTATION: &str = "opera_body_presentation";
    pub const HUMAN_STATE: &str = "opera_human_state";
    pub const ROBOT_STATE: &str = "opera_robot_state";
    pub const COLLISION_NOTIFICATION: &str = "opera_collision_notification";
}

/// Transport-level errors.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("publish failed: {0}")]
    Publish(String),
}

/// Outbound handle for one topic.
pub trait Publisher: Send {
    fn put(&self, payload: &str) -> std::result::Result<(), BrokerError>;
}

/// Owned subscription; dropping it unsubscribes.
pub trait Subscription: Send {}

/// Callback invoked by the broker for each received payload.
pub type SubscriberCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Access to one pub/sub substrate; cheap to clone, one per topic endpoint.
#[derive(Clone)]
pub enum BrokerAccess {
    Memory(Arc<MemoryBroker>),
}

impl BrokerAccess {
    /// A fresh in-memory loopback broker.
    pub fn memory() -> Self {
        BrokerAccess::Memory(Arc::new(MemoryBroker::new()))
    }

    pub fn make_publisher(&self, topic: &str) -> Box<dyn Publisher> {
        match self {
            BrokerAccess::Memory(broker) => broker.make_publisher(topic),
        }
    }

    pub fn subscribe(&self, topic: &str, callback: SubscriberCallback) -> Box<dyn Subscription> {
        match self {
            BrokerAccess::Memory(broker) => broker.subscribe(topic, callback),
        }
    }
}

/// One `(broker access, topic)` pair handed to the runtime.
#[derive(Clone)]
pub struct TopicEndpoint {
    pub access: BrokerAccess,
    pub topic: String,
}

impl TopicEndpoint {
    pub fn new(access: BrokerAccess, topic: impl Into<String>) -> Self {
        Self {
            access,
            topic: topic.into(),
        }
    }
}

fn required_env(name: &str) -> Result<String> {
    env::var(name).map_err(|_| {
        OperaError::Config(format!("environment variable {} is not set", name))
    })
}

/// MQTT connection settings, from `MQTT_BROKER_URI` / `MQTT_BROKER_PORT`.
#[derive(Debug, Clone, PartialEq)]
pub struct MqttAccessConfig {
    pub uri: String,
    pub port: u16,
}

impl MqttAccessConfig {
    pub fn from_env() -> Result<Self> {
        let uri = required_env("MQTT_BROKER_URI")?;
        let port = required_env("MQTT_BROKER_PORT")?
            .parse::<u16>()
            .map_err(|e| OperaError::Config(format!("invalid MQTT_BROKER_PORT: {}", e)))?;
        Ok(Self { uri, port })
    }
}

/// Kafka connection settings, from the `KAFKA_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct KafkaAccessConfig {
    pub broker_uri: String,
    pub sasl_mechanism: String,
    pub security_protocol: String,
    pub username: String,
    pub password: String,
    pub topic_prefix: String,
}

impl KafkaAccessConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            broker_uri: required_env("KAFKA_BROKER_URI")?,
            sasl_mechanism: required_env("KAFKA_SASL_MECHANISM")?,
            security_protocol: required_env("KAFKA_SECURITY_PROTOCOL")?,
            username: required_env("KAFKA_USERNAME")?,
            password: required_env("KAFKA_PASSWORD")?,
            topic_prefix: required_env("KAFKA_TOPIC_PREFIX")?,
        })
    }

    /// Topic name under this deployment's prefix.
    pub fn prefixed(&self, topic: &str) -> String {
        format!("{}{}", self.topic_prefix, topic)
    }
}
