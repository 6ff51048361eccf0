//! Opera - Real-time collision prediction for human-robot collaboration
//!
//! Opera monitors a collaborative workcell: it consumes skeletal pose
//! streams of a human and a robot off a pub/sub substrate, predicts along
//! the robot's look-ahead trajectory whether any human segment will come
//! within an unsafe distance of any robot segment, and publishes collision
//! notifications annotated with the predicted time-to-collision.
//!
//! # Architecture
//!
//! The crate is organized into 6 logical layers:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                     main                            │  ← Daemon / drivers
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                    runtime/                         │  ← Orchestration
//! │        (broker wiring, ingress/egress, models)      │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │              scheduler/   jobs/                     │  ← Worker pool
//! │        (dispatch, sleeping, look-ahead walks)       │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │             barriers/   history/                    │  ← Prediction state
//! │   (minimum-distance barriers, reuse cache, runs)    │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                body/   io/   state/                 │  ← Models and wire
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                     core/                           │  ← Foundation
//! │        (types, intervals, geometry, digests)        │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! # Pipeline
//!
//! `BodyPresentation` messages install the `Human`/`Robot` models. Robot
//! states extend the mode-segmented `RobotStateHistory`; each human state
//! creates one look-ahead job per `(human segment, robot segment)` pair.
//! Workers walk trajectory views sample by sample, composing swept capsules
//! and folding interval distances into monotone barrier sequences; a
//! breached barrier becomes a `CollisionNotification`. The reuse factory
//! short-circuits recomputation through a fingerprint-keyed barrier cache
//! when the robot revisits an equivalent trajectory prefix.

// ============================================================================
// Layer 1: Core foundation (no internal deps)
// ============================================================================
pub mod core;

// ============================================================================
// Layer 2: Errors, body models, observable state, wire I/O
// ============================================================================
pub mod body;
pub mod error;
pub mod io;
pub mod state;

// ============================================================================
// Layer 3: Prediction state (history, barriers, reuse cache)
// ============================================================================
pub mod barriers;
pub mod history;

// ============================================================================
// Layer 4: Jobs and the worker pool
// ============================================================================
pub mod jobs;
pub mod scheduler;

// ============================================================================
// Layer 5: Runtime orchestration
// ============================================================================
pub mod runtime;

// ============================================================================
// Convenience re-exports (flat namespace for common use)
// ============================================================================

// Core types
pub use crate::core::{
    BodyId, Fingerprint, FingerprintScheme, Interval, KeypointId, Mode, Point3, ReuseEquivalence,
    SegmentIndex, TimestampType,
};

// Errors
pub use error::{OperaError, Result};

// Body model
pub use body::{Human, HumanSegmentSample, HumanStateInstance, KeypointSphere, Robot, Segment};

// History
pub use history::{AcquireOutcome, RobotStateHistory, TrajectorySample, TrajectoryView};

// Barriers
pub use barriers::{Barrier, BarrierCache, BarrierSequence, BarrierUpdatePolicy, CacheKey};

// Jobs and scheduling
pub use jobs::{Breach, JobOutcome, JobState, LookAheadJob, LookAheadJobFactory, PairKey};
pub use scheduler::{JobScheduler, SchedulerConfig, SchedulerHandle};

// Observable counters
pub use state::{CountersHandle, RuntimeCounters};

// Runtime
pub use runtime::{Runtime, RuntimeConfig, RuntimeEndpoints};

// I/O
pub use io::{
    topics, BodyPresentationMessage, BodyStateEvent, BrokerAccess, CollisionDistance,
    CollisionNotificationMessage, HumanStateMessage, KafkaAccessConfig, MemoryBroker,
    MqttAccessConfig, RobotStateMessage, ScenarioResources, TopicEndpoint,
};
