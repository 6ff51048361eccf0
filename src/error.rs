//! Error types for the Opera runtime.
//!
//! # Error Recovery Strategies
//!
//! ## Dropped With a Counter (Pipeline Continues)
//!
//! - **`MalformedMessage`**: a payload failed to deserialise or failed model
//!   validation. The message is dropped, the drop counter is incremented and
//!   the error is logged. The subscription remains usable.
//! - **`OutOfOrder`**: a robot state carried a timestamp at or before the
//!   last acquired one. Dropped at history ingestion as duplicate or
//!   out-of-order.
//!
//! ## Retried (Egress Only)
//!
//! - **`Broker`**: transient publish failure. Retried with capped
//!   exponential backoff; on exhaustion the notification is dropped and the
//!   loss is logged. The pipeline never blocks on egress.
//!
//! ## Fatal For the Run
//!
//! - **`ModelConflict`**: a body was re-presented with a payload that is not
//!   byte-equivalent to the installed one. The configuration is inconsistent
//!   and the run is terminated.
//! - **`InternalInvariant`**: an internal invariant was violated (for
//!   example a barrier sequence turning non-monotone under a policy that
//!   forbids it). Always a bug; the run is terminated.
//! - **`Config`**: invalid configuration detected before the runtime starts.

use thiserror::Error;

/// Errors produced by the Opera runtime.
///
/// See module-level documentation for recovery strategies.
#[derive(Error, Debug)]
pub enum OperaError {
    #[error("malformed message on {topic}: {reason}")]
    MalformedMessage { topic: String, reason: String },

    #[error("out-of-order or duplicate state at t={timestamp}")]
    OutOfOrder { timestamp: u64 },

    #[error("conflicting re-presentation of body {id}")]
    ModelConflict { id: String },

    #[error("broker error: {0}")]
    Broker(String),

    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, OperaError>;
