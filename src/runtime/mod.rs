//! Runtime orchestrator: wires broker endpoints to the prediction pipeline.
//!
//! Construction subscribes to the body presentation, human state and robot
//! state topics and opens a publisher for collision notifications. Each
//! subscription feeds a bounded ingress queue drained by its own thread
//! (broker callbacks only copy payloads); an egress thread publishes
//! notifications with capped exponential backoff. State messages arriving
//! before both bodies are presented are buffered, not dropped, up to a
//! bounded backlog.
//!
//! Shutdown order: close subscriptions, drain ingress threads, stop the
//! worker pool (cancelling parked jobs), then close the publisher.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::bounded;

use crate::barriers::BarrierCache;
use crate::body::{Human, HumanStateInstance, Robot};
use crate::core::Point3;
use crate::error::{OperaError, Result};
use crate::history::RobotStateHistory;
use crate::io::messages::{
    BodyPresentationMessage, CollisionDistance, CollisionNotificationMessage, HumanStateMessage,
    RobotStateMessage,
};
use crate::io::{Publisher, Subscription, TopicEndpoint};
use crate::jobs::{Breach, LookAheadJobFactory, PairKey};
use crate::scheduler::{JobScheduler, SchedulerConfig, SchedulerHandle};
use crate::state::{CountersHandle, RuntimeCounters};

/// Runtime tuning knobs.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Worker count; 0 selects the hardware concurrency.
    pub concurrency: usize,
    /// Bound of each per-topic ingress queue; overflow drops the oldest.
    pub ingress_bound: usize,
    /// Bound of the pre-presentation state buffer.
    pub presentation_backlog: usize,
    /// Publish attempts before a notification is dropped.
    pub publish_attempts: u32,
    /// Initial publish retry backoff (doubles per attempt).
    pub publish_backoff_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            concurrency: 0,
            ingress_bound: 1024,
            presentation_backlog: 4096,
            publish_attempts: 5,
            publish_backoff_ms: 10,
        }
    }
}

/// The four topic endpoints the runtime is wired to.
#[derive(Clone)]
pub struct RuntimeEndpoints {
    pub body_presentation: TopicEndpoint,
    pub human_state: TopicEndpoint,
    pub robot_state: TopicEndpoint,
    pub collision_notification: TopicEndpoint,
}

impl RuntimeEndpoints {
    /// All four topics on one substrate with the default topic names.
    pub fn on(access: crate::io::BrokerAccess) -> Self {
        use crate::io::topics;
        Self {
            body_presentation: TopicEndpoint::new(access.clone(), topics::BODY_PRESENTATION),
            human_state: TopicEndpoint::new(access.clone(), topics::HUMAN_STATE),
            robot_state: TopicEndpoint::new(access.clone(), topics::ROBOT_STATE),
            collision_notification: TopicEndpoint::new(access, topics::COLLISION_NOTIFICATION),
        }
    }
}

/// Bounded FIFO of raw payloads between a broker callback and its ingress
/// thread; overflow drops the oldest entry.
struct IngressQueue {
    inner: Mutex<IngressInner>,
    ready: Condvar,
    bound: usize,
}

#[derive(Default)]
struct IngressInner {
    items: VecDeque<String>,
    closed: bool,
}

impl IngressQueue {
    fn new(bound: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(IngressInner::default()),
            ready: Condvar::new(),
            bound: bound.max(1),
        })
    }

    /// Returns true when an older payload was dropped to make room.
    fn push(&self, payload: String) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let mut dropped = false;
        if inner.items.len() >= self.bound {
            inner.items.pop_front();
            dropped = true;
        }
        inner.items.push_back(payload);
        self.ready.notify_one();
        dropped
    }

    /// Blocks for the next payload; `None` once closed and drained.
    fn pop(&self) -> Option<String> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(item) = inner.items.pop_front() {
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            inner = self.ready.wait(inner).unwrap();
        }
    }

    fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        self.ready.notify_all();
    }
}

/// Installed body models plus the pre-presentation buffer.
#[derive(Default)]
struct ModelState {
    human: Option<Arc<Human>>,
    robot: Option<Arc<Robot>>,
    human_raw: Option<String>,
    robot_raw: Option<String>,
    first_jobs_created: bool,
    /// Presentation drain in progress; state messages keep buffering so the
    /// buffered prefix is processed in order.
    draining: bool,
    buffered_human: VecDeque<HumanStateMessage>,
    buffered_robot: VecDeque<RobotStateMessage>,
}

struct RuntimeShared {
    config: RuntimeConfig,
    counters: CountersHandle,
    history: Arc<RwLock<RobotStateHistory>>,
    factory: LookAheadJobFactory,
    models: Mutex<ModelState>,
    scheduler: SchedulerHandle,
    running: Arc<AtomicBool>,
    fatal: AtomicBool,
}

/// The on-line collision-prediction runtime.
pub struct Runtime {
    shared: Arc<RuntimeShared>,
    scheduler: Option<JobScheduler>,
    subscriptions: Vec<Box<dyn Subscription>>,
    queues: Vec<Arc<IngressQueue>>,
    ingress_threads: Vec<JoinHandle<()>>,
    egress_thread: Option<JoinHandle<()>>,
}

impl Runtime {
    /// Wire the runtime to four `(broker access, topic)` endpoints.
    pub fn new(
        endpoints: RuntimeEndpoints,
        factory: LookAheadJobFactory,
        config: RuntimeConfig,
        running: Arc<AtomicBool>,
    ) -> Result<Self> {
        let counters = RuntimeCounters::new();
        // Placeholder gap bound until the robot presentation arrives; no
        // robot state is acquired before that.
        let history = Arc::new(RwLock::new(RobotStateHistory::new(200_000_000)));
        let cache = Arc::new(BarrierCache::new());
        let (breach_tx, breach_rx) = bounded::<Breach>(1024);

        let scheduler = JobScheduler::new(
            SchedulerConfig {
                concurrency: config.concurrency,
            },
            Arc::clone(&history),
            Arc::clone(&cache),
            Arc::clone(&counters),
            breach_tx,
            Arc::clone(&running),
        );

        let shared = Arc::new(RuntimeShared {
            config: config.clone(),
            counters: Arc::clone(&counters),
            history,
            factory,
            models: Mutex::new(ModelState::default()),
            scheduler: scheduler.handle(),
            running,
            fatal: AtomicBool::new(false),
        });

        // One bounded queue and one ingress thread per subscribed topic.
        let mut subscriptions = Vec::new();
        let mut queues = Vec::new();
        let mut ingress_threads = Vec::new();
        let ingress_topics: [(&str, TopicEndpoint, fn(&RuntimeShared, String)); 3] = [
            (
                "ingress-presentation",
                endpoints.body_presentation,
                handle_presentation_payload,
            ),
            ("ingress-human", endpoints.human_state, handle_human_payload),
            ("ingress-robot", endpoints.robot_state, handle_robot_payload),
        ];
        for (name, endpoint, handler) in ingress_topics {
            let queue = IngressQueue::new(config.ingress_bound);
            let callback_queue = Arc::clone(&queue);
            let callback_counters = Arc::clone(&counters);
            let subscription = endpoint.access.subscribe(
                &endpoint.topic,
                Box::new(move |payload| {
                    if callback_queue.push(payload.to_string()) {
                        callback_counters.record_dropped();
                    }
                }),
            );
            let thread_queue = Arc::clone(&queue);
            let thread_shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(name.to_string())
                .spawn(move || {
                    while let Some(payload) = thread_queue.pop() {
                        handler(&thread_shared, payload);
                    }
                })
                .map_err(|e| OperaError::Config(format!("spawn {}: {}", name, e)))?;
            subscriptions.push(subscription);
            queues.push(queue);
            ingress_threads.push(handle);
        }

        // Egress: publish notifications, retrying transient failures.
        let publisher = endpoints
            .collision_notification
            .access
            .make_publisher(&endpoints.collision_notification.topic);
        let egress_shared = Arc::clone(&shared);
        let egress_thread = thread::Builder::new()
            .name("egress".to_string())
            .spawn(move || {
                while let Ok(breach) = breach_rx.recv() {
                    publish_notification(&egress_shared, publisher.as_ref(), breach);
                }
            })
            .map_err(|e| OperaError::Config(format!("spawn egress: {}", e)))?;

        log::info!("runtime wired: 3 subscriptions, 1 publisher");

        Ok(Self {
            shared,
            scheduler: Some(scheduler),
            subscriptions,
            queues,
            ingress_threads,
            egress_thread: Some(egress_thread),
        })
    }

    /// All four default topics on a single substrate.
    pub fn with_access(
        access: crate::io::BrokerAccess,
        factory: LookAheadJobFactory,
        config: RuntimeConfig,
        running: Arc<AtomicBool>,
    ) -> Result<Self> {
        Self::new(RuntimeEndpoints::on(access), factory, config, running)
    }

    pub fn counters(&self) -> &CountersHandle {
        &self.shared.counters
    }

    pub fn num_state_messages_received(&self) -> u64 {
        self.shared.counters.num_state_messages_received()
    }

    pub fn num_processed(&self) -> u64 {
        self.shared.counters.num_processed()
    }

    pub fn num_completed(&self) -> u64 {
        self.shared.counters.num_completed()
    }

    pub fn num_collisions(&self) -> u64 {
        self.shared.counters.num_collisions()
    }

    pub fn num_dropped_messages(&self) -> u64 {
        self.shared.counters.num_dropped_messages()
    }

    pub fn num_geometry_calls(&self) -> u64 {
        self.shared.counters.num_geometry_calls()
    }

    pub fn num_sleeping_jobs(&self) -> u64 {
        self.shared.counters.num_sleeping_jobs()
    }

    pub fn num_pending_human_robot_pairs(&self) -> u64 {
        self.shared.counters.num_pending_human_robot_pairs()
    }

    /// Human segments times robot segments, once both bodies are presented.
    pub fn num_segment_pairs(&self) -> usize {
        let models = self.shared.models.lock().unwrap();
        match (&models.human, &models.robot) {
            (Some(h), Some(r)) => h.segments.len() * r.segments.len(),
            _ => 0,
        }
    }

    /// Nothing queued or running; every outstanding job sleeps.
    pub fn all_done(&self) -> bool {
        self.shared.scheduler.all_done()
    }

    /// A fatal error (model conflict, invariant) has been latched.
    pub fn is_fatal(&self) -> bool {
        self.shared.fatal.load(Ordering::Relaxed)
    }

    /// Await a counter-driven predicate (condition-variable based).
    pub fn wait_for<F: Fn() -> bool>(&self, pred: F, timeout: Duration) -> bool {
        self.shared.counters.wait_for(pred, timeout)
    }

    /// Await pipeline quiescence.
    pub fn wait_all_done(&self, timeout: Duration) -> bool {
        let scheduler = self.shared.scheduler.clone();
        self.shared
            .counters
            .wait_for(move || scheduler.all_done(), timeout)
    }

    /// Close subscribers, drain workers, close the publisher.
    pub fn shutdown(&mut self) {
        if self.scheduler.is_none() {
            return;
        }
        log::info!("runtime shutting down");
        self.subscriptions.clear();
        for queue in &self.queues {
            queue.close();
        }
        for handle in self.ingress_threads.drain(..) {
            if handle.join().is_err() {
                log::error!("ingress thread panicked");
            }
        }
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.shutdown();
        }
        if let Some(handle) = self.egress_thread.take() {
            if handle.join().is_err() {
                log::error!("egress thread panicked");
            }
        }
        log::info!("runtime shutdown complete");
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn latch_fatal(shared: &RuntimeShared, error: &OperaError) {
    log::error!("fatal runtime error: {}", error);
    shared.fatal.store(true, Ordering::Relaxed);
    shared.running.store(false, Ordering::Relaxed);
}

// ---------------------------------------------------------------------------
// Ingress handlers (one thread per topic)
// ---------------------------------------------------------------------------

fn handle_presentation_payload(shared: &RuntimeShared, payload: String) {
    let message: BodyPresentationMessage = match serde_json::from_str(&payload) {
        Ok(m) => m,
        Err(e) => {
            log::warn!("malformed body presentation dropped: {}", e);
            shared.counters.record_dropped();
            return;
        }
    };

    let mut models = shared.models.lock().unwrap();
    if message.is_human {
        if let Some(raw) = &models.human_raw {
            if *raw == payload {
                log::debug!("human {} re-presented unchanged", message.id);
            } else {
                latch_fatal(
                    shared,
                    &OperaError::ModelConflict {
                        id: message.id.clone(),
                    },
                );
            }
            return;
        }
        match message.to_human() {
            Ok(human) => {
                log::info!(
                    "human {} presented: {} segments, {} keypoints",
                    human.id,
                    human.segments.len(),
                    human.num_points()
                );
                models.human = Some(Arc::new(human));
                models.human_raw = Some(payload);
            }
            Err(e) => {
                log::warn!("invalid human presentation dropped: {}", e);
                shared.counters.record_dropped();
                return;
            }
        }
    } else {
        if let Some(raw) = &models.robot_raw {
            if *raw == payload {
                log::debug!("robot {} re-presented unchanged", message.id);
            } else {
                latch_fatal(
                    shared,
                    &OperaError::ModelConflict {
                        id: message.id.clone(),
                    },
                );
            }
            return;
        }
        match message.to_robot() {
            Ok(robot) => {
                log::info!(
                    "robot {} presented: {} segments, {} keypoints, {} Hz",
                    robot.id,
                    robot.segments.len(),
                    robot.num_points(),
                    robot.message_frequency
                );
                shared
                    .history
                    .write()
                    .unwrap()
                    .set_gap_bound(robot.sample_gap_bound_ns());
                models.robot = Some(Arc::new(robot));
                models.robot_raw = Some(payload);
            }
            Err(e) => {
                log::warn!("invalid robot presentation dropped: {}", e);
                shared.counters.record_dropped();
                return;
            }
        }
    }

    if models.human.is_some() && models.robot.is_some() && !models.first_jobs_created {
        shared.counters.set_pending_pairs(1);
        models.draining = true;
        drop(models);
        drain_buffered(shared);
    }
}

/// Replay buffered state messages in timestamp order (human first on ties)
/// once both bodies are present; new arrivals keep buffering until the
/// backlog is empty so ordering is preserved.
fn drain_buffered(shared: &RuntimeShared) {
    loop {
        let next = {
            let mut models = shared.models.lock().unwrap();
            let human_ts = models.buffered_human.front().map(|m| m.timestamp);
            let robot_ts = models.buffered_robot.front().map(|m| m.timestamp);
            match (human_ts, robot_ts) {
                (None, None) => {
                    models.draining = false;
                    return;
                }
                (Some(_), None) => {
                    BufferedEvent::Human(models.buffered_human.pop_front().unwrap())
                }
                (None, Some(_)) => {
                    BufferedEvent::Robot(models.buffered_robot.pop_front().unwrap())
                }
                (Some(h), Some(r)) => {
                    if h > r {
                        BufferedEvent::Robot(models.buffered_robot.pop_front().unwrap())
                    } else {
                        BufferedEvent::Human(models.buffered_human.pop_front().unwrap())
                    }
                }
            }
        };
        match next {
            BufferedEvent::Human(message) => process_human_state(shared, message),
            BufferedEvent::Robot(message) => process_robot_state(shared, message),
        }
    }
}

enum BufferedEvent {
    Human(HumanStateMessage),
    Robot(RobotStateMessage),
}

fn handle_human_payload(shared: &RuntimeShared, payload: String) {
    let message: HumanStateMessage = match serde_json::from_str(&payload) {
        Ok(m) => m,
        Err(e) => {
            log::warn!("malformed human state dropped: {}", e);
            shared.counters.record_dropped();
            return;
        }
    };

    let buffered = {
        let mut models = shared.models.lock().unwrap();
        if models.human.is_none() || models.robot.is_none() || models.draining {
            if models.buffered_human.len() >= shared.config.presentation_backlog {
                models.buffered_human.pop_front();
                shared.counters.record_dropped();
            }
            models.buffered_human.push_back(message.clone());
            true
        } else {
            false
        }
    };
    if !buffered {
        process_human_state(shared, message);
    }
    // Counted once handling is finished, so a driver that awaits the
    // received count may rely on the message's effects being visible.
    shared.counters.record_state_message();
}

fn handle_robot_payload(shared: &RuntimeShared, payload: String) {
    let message: RobotStateMessage = match serde_json::from_str(&payload) {
        Ok(m) => m,
        Err(e) => {
            log::warn!("malformed robot state dropped: {}", e);
            shared.counters.record_dropped();
            return;
        }
    };

    let buffered = {
        let mut models = shared.models.lock().unwrap();
        if models.human.is_none() || models.robot.is_none() || models.draining {
            if models.buffered_robot.len() >= shared.config.presentation_backlog {
                models.buffered_robot.pop_front();
                shared.counters.record_dropped();
            }
            models.buffered_robot.push_back(message.clone());
            true
        } else {
            false
        }
    };
    if !buffered {
        process_robot_state(shared, message);
    }
    // Counted once handling is finished, so a driver that awaits the
    // received count may rely on the message's effects being visible.
    shared.counters.record_state_message();
}

// ---------------------------------------------------------------------------
// State processing
// ---------------------------------------------------------------------------

fn process_robot_state(shared: &RuntimeShared, message: RobotStateMessage) {
    let robot = {
        let models = shared.models.lock().unwrap();
        match &models.robot {
            Some(robot) => Arc::clone(robot),
            None => return,
        }
    };

    if message.points.len() != robot.num_points() {
        log::warn!(
            "robot state at t={} has {} keypoints, expected {}; dropped",
            message.timestamp,
            message.points.len(),
            robot.num_points()
        );
        shared.counters.record_dropped();
        return;
    }
    let mut points = Vec::with_capacity(message.points.len());
    for collapsed in message.keypoint_points() {
        match collapsed {
            Some(point) => points.push(point),
            None => {
                log::warn!(
                    "robot state at t={} has an empty keypoint; dropped",
                    message.timestamp
                );
                shared.counters.record_dropped();
                return;
            }
        }
    }

    let outcome = {
        let mut history = shared.history.write().unwrap();
        history.acquire(message.mode, points, message.timestamp)
    };
    match outcome {
        Ok(outcome) => {
            shared.scheduler.wake_history(outcome.run_index);
            if outcome.opened_new_run && outcome.run_index > 0 {
                shared.scheduler.wake_history(outcome.run_index - 1);
            }
        }
        Err(OperaError::OutOfOrder { timestamp }) => {
            log::debug!("out-of-order robot state at t={} dropped", timestamp);
            shared.counters.record_dropped();
        }
        Err(e) => {
            log::warn!("robot state rejected: {}", e);
            shared.counters.record_dropped();
        }
    }
}

fn process_human_state(shared: &RuntimeShared, message: HumanStateMessage) {
    let (human, robot) = {
        let models = shared.models.lock().unwrap();
        match (&models.human, &models.robot) {
            (Some(h), Some(r)) => (Arc::clone(h), Arc::clone(r)),
            _ => return,
        }
    };

    let keypoints = match message.bodies.get(&human.id) {
        Some(k) => k,
        None => {
            log::debug!(
                "human state at t={} carries no body {}",
                message.timestamp,
                human.id
            );
            return;
        }
    };

    let candidates = keypoints.iter().filter_map(|(keypoint_id, positions)| {
        human.keypoint_index(keypoint_id).map(|index| {
            (
                index,
                positions.iter().map(|p| Point3::from(*p)).collect::<Vec<_>>(),
            )
        })
    });
    let instance = HumanStateInstance::new(&human, message.timestamp, candidates);

    let view = {
        let history = shared.history.read().unwrap();
        history.snapshot(message.timestamp)
    };
    let view = match view {
        Some(view) => view,
        None => {
            log::debug!(
                "human state at t={} precedes robot history; no jobs",
                message.timestamp
            );
            return;
        }
    };
    if view.mode.is_empty() {
        log::debug!(
            "human state at t={} anchors an empty-mode run; no jobs",
            message.timestamp
        );
        return;
    }

    let mut created = 0usize;
    for human_segment in &human.segments {
        let sample = match instance.segment_sample(human_segment) {
            Some(sample) => sample,
            None => continue,
        };
        for robot_segment in &robot.segments {
            let job = shared.factory.build(
                PairKey {
                    human_segment: human_segment.index,
                    robot_segment: robot_segment.index,
                },
                sample,
                message.timestamp,
                robot_segment.clone(),
                view.clone(),
            );
            shared.scheduler.submit(job);
            created += 1;
        }
    }

    if created > 0 {
        let mut models = shared.models.lock().unwrap();
        if !models.first_jobs_created {
            models.first_jobs_created = true;
            shared.counters.set_pending_pairs(0);
        }
    }
}

// ---------------------------------------------------------------------------
// Egress
// ---------------------------------------------------------------------------

fn publish_notification(shared: &RuntimeShared, publisher: &dyn Publisher, breach: Breach) {
    let (human, robot) = {
        let models = shared.models.lock().unwrap();
        match (&models.human, &models.robot) {
            (Some(h), Some(r)) => (Arc::clone(h), Arc::clone(r)),
            _ => return,
        }
    };

    let human_segment = &human.segments[usize::from(breach.pair.human_segment)];
    let message = CollisionNotificationMessage {
        human_id: human.id.clone(),
        human_segment: (human_segment.head, human_segment.tail),
        human_segment_id: breach.pair.human_segment,
        robot_id: robot.id.clone(),
        robot_segment_id: breach.pair.robot_segment,
        current_time: breach.current_time,
        collision_distance: CollisionDistance {
            lower: breach.span.0.saturating_sub(breach.current_time),
            upper: breach.span.1.saturating_sub(breach.current_time),
        },
        likelihood: breach.likelihood,
        mode: breach.mode,
    };
    let payload = match serde_json::to_string(&message) {
        Ok(p) => p,
        Err(e) => {
            log::error!("notification serialisation failed: {}", e);
            return;
        }
    };

    let mut backoff = Duration::from_millis(shared.config.publish_backoff_ms);
    for attempt in 1..=shared.config.publish_attempts {
        match publisher.put(&payload) {
            Ok(()) => return,
            Err(e) => {
                if attempt == shared.config.publish_attempts {
                    log::error!(
                        "collision notification lost after {} attempts: {}",
                        attempt,
                        e
                    );
                    shared.counters.record_dropped();
                } else {
                    log::warn!("publish attempt {} failed: {}; retrying", attempt, e);
                    thread::sleep(backoff);
                    backoff *= 2;
                }
            }
        }
    }
}
