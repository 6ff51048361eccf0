//! Runtime Pipeline Tests
//!
//! End-to-end tests over the in-memory broker: sleeping/wake behaviour,
//! out-of-order rejection, empty-mode boundaries, reuse cache hits across
//! revisited trajectories, and ingress backpressure.
//!
//! Run with: `cargo test --test runtime_pipeline`

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use opera::io::Subscription;
use opera::{
    topics, BarrierUpdatePolicy, BodyPresentationMessage, BrokerAccess,
    CollisionNotificationMessage, HumanStateMessage, LookAheadJobFactory, Mode,
    ReuseEquivalence, RobotStateMessage, Runtime, RuntimeConfig,
};

const WAIT: Duration = Duration::from_secs(20);
const PERIOD: u64 = 50_000_000;
const T0: u64 = 1_000_000_000;

fn human_presentation(thickness: f64) -> BodyPresentationMessage {
    BodyPresentationMessage {
        id: "h0".to_string(),
        is_human: true,
        segment_pairs: vec![(0, 1)],
        thicknesses: vec![thickness],
        message_frequency: None,
        point_ids: None,
    }
}

fn robot_presentation(thickness: f64) -> BodyPresentationMessage {
    BodyPresentationMessage {
        id: "r0".to_string(),
        is_human: false,
        segment_pairs: vec![(0, 1)],
        thicknesses: vec![thickness],
        message_frequency: Some(20.0),
        point_ids: None,
    }
}

fn human_state(timestamp: u64, x: f64, z_top: f64) -> HumanStateMessage {
    let mut keypoints = BTreeMap::new();
    keypoints.insert("0".to_string(), vec![[x, 0.0, 0.0]]);
    keypoints.insert("1".to_string(), vec![[x, 0.0, z_top]]);
    let mut bodies = BTreeMap::new();
    bodies.insert("h0".to_string(), keypoints);
    HumanStateMessage { timestamp, bodies }
}

fn robot_state(timestamp: u64, y: f64, mode_label: Option<&str>) -> RobotStateMessage {
    RobotStateMessage {
        timestamp,
        mode: match mode_label {
            Some(label) => Mode::from_pairs([("motion", label)]),
            None => Mode::empty(),
        },
        points: vec![vec![[-0.5, y, 0.0]], vec![[0.5, y, 0.0]]],
    }
}

struct Harness {
    access: BrokerAccess,
    runtime: Runtime,
    notifications: Arc<Mutex<Vec<CollisionNotificationMessage>>>,
    _subscription: Box<dyn Subscription>,
    sent: u64,
}

impl Harness {
    fn with_config(factory: LookAheadJobFactory, config: RuntimeConfig) -> Self {
        let access = BrokerAccess::memory();
        let running = Arc::new(AtomicBool::new(true));
        let runtime =
            Runtime::with_access(access.clone(), factory, config, running).unwrap();

        let notifications: Arc<Mutex<Vec<CollisionNotificationMessage>>> =
            Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&notifications);
        let subscription = access.subscribe(
            topics::COLLISION_NOTIFICATION,
            Box::new(move |payload| {
                let message = serde_json::from_str(payload).unwrap();
                sink.lock().unwrap().push(message);
            }),
        );

        Self {
            access,
            runtime,
            notifications,
            _subscription: subscription,
            sent: 0,
        }
    }

    fn new(factory: LookAheadJobFactory) -> Self {
        Self::with_config(
            factory,
            RuntimeConfig {
                concurrency: 2,
                ..RuntimeConfig::default()
            },
        )
    }

    fn present_bodies(&self, human_thickness: f64, robot_thickness: f64) {
        let publisher = self.access.make_publisher(topics::BODY_PRESENTATION);
        publisher
            .put(&serde_json::to_string(&robot_presentation(robot_thickness)).unwrap())
            .unwrap();
        publisher
            .put(&serde_json::to_string(&human_presentation(human_thickness)).unwrap())
            .unwrap();
        assert!(self.runtime.wait_for(
            || self.runtime.counters().num_pending_human_robot_pairs() == 1,
            WAIT
        ));
    }

    fn send_human(&mut self, message: &HumanStateMessage) {
        self.access
            .make_publisher(topics::HUMAN_STATE)
            .put(&serde_json::to_string(message).unwrap())
            .unwrap();
        self.sent += 1;
        self.await_ingest();
    }

    fn send_robot(&mut self, message: &RobotStateMessage) {
        self.access
            .make_publisher(topics::ROBOT_STATE)
            .put(&serde_json::to_string(message).unwrap())
            .unwrap();
        self.sent += 1;
        self.await_ingest();
    }

    fn await_ingest(&self) {
        let sent = self.sent;
        assert!(self.runtime.wait_for(
            || self.runtime.counters().num_state_messages_received() >= sent,
            WAIT
        ));
    }

    fn quiesce(&self) {
        assert!(self.runtime.wait_all_done(WAIT));
    }
}

// ============================================================================
// Sleeping and waking
// ============================================================================

#[test]
fn test_single_sample_sleeps_then_wakes_to_breach() {
    let mut h = Harness::new(LookAheadJobFactory::discard());
    h.present_bodies(0.05, 0.05);

    h.send_robot(&robot_state(T0, 4.0, Some("approach")));
    h.send_human(&human_state(T0 + 1_000, 0.0, 1.0));

    // One pair, one job, parked at the history frontier.
    assert!(h
        .runtime
        .wait_for(|| h.runtime.counters().num_sleeping_jobs() == 1, WAIT));
    h.quiesce();
    assert_eq!(h.runtime.num_pending_human_robot_pairs(), 0);
    assert_eq!(h.runtime.num_completed(), 0);

    // Extending the history wakes the job and drives it through the breach.
    h.send_robot(&robot_state(T0 + PERIOD, 0.0, Some("approach")));
    assert!(h
        .runtime
        .wait_for(|| h.runtime.counters().num_collisions() == 1, WAIT));
    h.quiesce();

    let notifications = h.notifications.lock().unwrap();
    assert_eq!(notifications.len(), 1);
    let n = &notifications[0];
    assert_eq!(n.human_id, "h0");
    assert_eq!(n.robot_id, "r0");
    assert_eq!(n.current_time, T0 + 1_000);
    assert!(n.collision_distance.lower <= n.collision_distance.upper);
    assert!(n.collision_distance.upper <= PERIOD);
    assert!(n.likelihood >= 0.0 && n.likelihood <= 1.0);
    assert!(!n.mode.is_empty());
}

#[test]
fn test_breach_emitted_within_two_robot_samples() {
    let mut h = Harness::new(LookAheadJobFactory::discard());
    h.present_bodies(0.05, 0.05);

    // First sub-threshold approach (y below the 0.1 thickness sum) happens
    // at the fifth robot sample.
    let trajectory = [2.0, 1.5, 1.0, 0.5, 0.08, 0.07];
    h.send_robot(&robot_state(T0, trajectory[0], Some("approach")));
    h.send_human(&human_state(T0 + 1_000, 0.0, 1.0));
    for (i, y) in trajectory.iter().enumerate().skip(1) {
        h.send_robot(&robot_state(T0 + i as u64 * PERIOD, *y, Some("approach")));
    }
    assert!(h
        .runtime
        .wait_for(|| h.runtime.counters().num_collisions() >= 1, WAIT));

    let notifications = h.notifications.lock().unwrap();
    let n = &notifications[0];
    let first_breach_sample = T0 + 4 * PERIOD;
    let predicted = n.current_time + n.collision_distance.upper;
    assert!(predicted <= first_breach_sample + 2 * PERIOD);
    assert!(n.current_time + n.collision_distance.lower <= first_breach_sample);
}

// ============================================================================
// Rejection boundaries
// ============================================================================

#[test]
fn test_out_of_order_robot_state_is_dropped() {
    let mut h = Harness::new(LookAheadJobFactory::discard());
    h.present_bodies(0.05, 0.05);

    h.send_robot(&robot_state(T0, 5.0, Some("hold")));
    h.send_robot(&robot_state(T0 + PERIOD, 5.0, Some("hold")));
    h.quiesce();

    let processed = h.runtime.num_processed();
    let collisions = h.runtime.num_collisions();
    let dropped = h.runtime.num_dropped_messages();

    // Duplicate timestamp: rejected at history ingestion.
    h.send_robot(&robot_state(T0 + PERIOD, 5.0, Some("hold")));
    h.quiesce();

    assert_eq!(h.runtime.num_dropped_messages(), dropped + 1);
    assert_eq!(h.runtime.num_processed(), processed);
    assert_eq!(h.runtime.num_collisions(), collisions);
}

#[test]
fn test_empty_mode_run_produces_no_jobs() {
    let mut h = Harness::new(LookAheadJobFactory::discard());
    h.present_bodies(0.05, 0.05);

    h.send_robot(&robot_state(T0, 0.0, None));
    h.send_human(&human_state(T0 + 1_000, 0.0, 1.0));
    h.quiesce();

    assert_eq!(h.runtime.num_processed(), 0);
    assert_eq!(h.runtime.num_collisions(), 0);
    assert!(h.notifications.lock().unwrap().is_empty());
    // The pair stays pending until a job can actually be created.
    assert_eq!(h.runtime.num_pending_human_robot_pairs(), 1);
}

#[test]
fn test_zero_thickness_coincident_points_collide() {
    let mut h = Harness::new(LookAheadJobFactory::discard());
    h.present_bodies(0.0, 0.0);

    // Degenerate human segment: both keypoints on the robot's path.
    h.send_robot(&robot_state(T0, 1.0, Some("touch")));
    h.send_human(&human_state(T0 + 1_000, 0.0, 0.0));
    h.send_robot(&robot_state(T0 + PERIOD, 0.0, Some("touch")));

    assert!(h
        .runtime
        .wait_for(|| h.runtime.counters().num_collisions() == 1, WAIT));
    let notifications = h.notifications.lock().unwrap();
    assert_eq!(notifications.len(), 1);
}

// ============================================================================
// Reuse across revisited trajectories
// ============================================================================

#[test]
fn test_trajectory_revisit_reuses_cached_barriers() {
    let factory = LookAheadJobFactory::reuse(
        BarrierUpdatePolicy::AddWhenDifferentMinimumDistance,
        ReuseEquivalence::Strong,
    );
    let mut h = Harness::new(factory);
    h.present_bodies(0.05, 0.05);

    // First pass of mode "loop": far from the human, closed by empty mode.
    h.send_robot(&robot_state(T0, 6.0, Some("loop")));
    h.send_human(&human_state(T0 + 1_000, 0.0, 1.0));
    h.send_robot(&robot_state(T0 + PERIOD, 5.5, Some("loop")));
    h.send_robot(&robot_state(T0 + 2 * PERIOD, 5.0, Some("loop")));
    h.send_robot(&robot_state(T0 + 3 * PERIOD, 5.0, None));
    h.quiesce();
    assert_eq!(h.runtime.num_completed(), 1);

    let calls_first = h.runtime.num_geometry_calls();
    assert!(calls_first > 0);

    // Two seconds later the robot replays the identical prefix and the
    // human stands in the same pose. The whole prefix is in the history
    // before the human sample anchors a job at its start, so the barrier
    // build is served from the cache without touching the geometry kernel.
    let t1 = T0 + 2_000_000_000;
    h.send_robot(&robot_state(t1, 6.0, Some("loop")));
    h.send_robot(&robot_state(t1 + PERIOD, 5.5, Some("loop")));
    h.send_robot(&robot_state(t1 + 2 * PERIOD, 5.0, Some("loop")));
    h.send_human(&human_state(t1 + 1_000, 0.0, 1.0));
    h.send_robot(&robot_state(t1 + 3 * PERIOD, 5.0, None));
    assert!(h
        .runtime
        .wait_for(|| h.runtime.counters().num_completed() == 2, WAIT));
    h.quiesce();

    assert_eq!(h.runtime.num_geometry_calls(), calls_first);
}

// ============================================================================
// Backpressure
// ============================================================================

#[test]
fn test_ingress_burst_drains_cleanly() {
    let mut h = Harness::with_config(
        LookAheadJobFactory::discard(),
        RuntimeConfig {
            concurrency: 2,
            ingress_bound: 8,
            ..RuntimeConfig::default()
        },
    );
    h.present_bodies(0.05, 0.05);

    h.send_robot(&robot_state(T0, 5.0, Some("sweep")));
    h.send_human(&human_state(T0 + 1_000, 50.0, 1.0));

    // Burst far beyond the ingress bound without pacing; the queue may shed
    // its oldest entries but the pipeline must stay consistent.
    let publisher = h.access.make_publisher(topics::ROBOT_STATE);
    let burst = 80u64;
    for i in 1..=burst {
        publisher
            .put(&serde_json::to_string(&robot_state(T0 + i * PERIOD, 5.0, Some("sweep"))).unwrap())
            .unwrap();
    }
    // Closing empty-mode message, paced so it cannot be shed.
    assert!(h.runtime.wait_for(
        || {
            h.runtime.counters().num_state_messages_received()
                + h.runtime.counters().num_dropped_messages()
                >= burst + 2
        },
        WAIT
    ));
    h.send_robot(&robot_state(T0 + (burst + 1) * PERIOD, 5.0, None));

    h.quiesce();
    assert!(h
        .runtime
        .wait_for(|| h.runtime.counters().num_sleeping_jobs() == 0, WAIT));
    assert_eq!(h.runtime.num_completed(), h.runtime.num_processed());
    assert_eq!(h.runtime.num_collisions(), 0);
}
