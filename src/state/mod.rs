//! Observable runtime state shared between threads.
//!
//! All pipeline progress is surfaced through [`RuntimeCounters`]: atomic
//! counters (monotonic since start, except the sleeping gauge) plus a
//! condition variable so drivers can await counter changes instead of
//! polling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Counters observable from outside the pipeline.
#[derive(Debug, Default)]
pub struct RuntimeCounters {
    state_messages_received: AtomicU64,
    processed: AtomicU64,
    completed: AtomicU64,
    collisions: AtomicU64,
    dropped_messages: AtomicU64,
    geometry_calls: AtomicU64,
    sleeping_jobs: AtomicU64,
    pending_human_robot_pairs: AtomicU64,
    epoch: Mutex<u64>,
    signal: Condvar,
}

impl RuntimeCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Wake every thread waiting on counter changes.
    fn bump(&self) {
        let mut epoch = self.epoch.lock().unwrap();
        *epoch += 1;
        self.signal.notify_all();
    }

    /// Block until `pred` holds or the timeout elapses. Returns whether the
    /// predicate held.
    ///
    /// The predicate is evaluated outside the epoch lock (it may take other
    /// locks itself); the epoch counter makes the check race-free: any state
    /// change bumps the epoch, so a change between the evaluation and the
    /// wait skips the wait entirely.
    pub fn wait_for<F: Fn() -> bool>(&self, pred: F, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let observed = *self.epoch.lock().unwrap();
            if pred() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let epoch = self.epoch.lock().unwrap();
            if *epoch != observed {
                continue;
            }
            let _ = self.signal.wait_timeout(epoch, deadline - now).unwrap();
        }
    }

    pub fn record_state_message(&self) {
        self.state_messages_received.fetch_add(1, Ordering::Relaxed);
        self.bump();
    }

    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.bump();
    }

    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.bump();
    }

    pub fn record_collision(&self) {
        self.collisions.fetch_add(1, Ordering::Relaxed);
        self.bump();
    }

    pub fn record_dropped(&self) {
        self.dropped_messages.fetch_add(1, Ordering::Relaxed);
        self.bump();
    }

    pub fn add_geometry_calls(&self, calls: u64) {
        self.geometry_calls.fetch_add(calls, Ordering::Relaxed);
    }

    pub fn inc_sleeping(&self) {
        self.sleeping_jobs.fetch_add(1, Ordering::Relaxed);
        self.bump();
    }

    pub fn dec_sleeping(&self) {
        self.sleeping_jobs.fetch_sub(1, Ordering::Relaxed);
        self.bump();
    }

    pub fn set_pending_pairs(&self, pending: u64) {
        self.pending_human_robot_pairs
            .store(pending, Ordering::Relaxed);
        self.bump();
    }

    pub fn num_state_messages_received(&self) -> u64 {
        self.state_messages_received.load(Ordering::Relaxed)
    }

    pub fn num_processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn num_completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn num_collisions(&self) -> u64 {
        self.collisions.load(Ordering::Relaxed)
    }

    pub fn num_dropped_messages(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    pub fn num_geometry_calls(&self) -> u64 {
        self.geometry_calls.load(Ordering::Relaxed)
    }

    pub fn num_sleeping_jobs(&self) -> u64 {
        self.sleeping_jobs.load(Ordering::Relaxed)
    }

    pub fn num_pending_human_robot_pairs(&self) -> u64 {
        self.pending_human_robot_pairs.load(Ordering::Relaxed)
    }
}

/// Handle type for the shared counters.
pub type CountersHandle = Arc<RuntimeCounters>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_counters_accumulate() {
        let counters = RuntimeCounters::new();
        counters.record_state_message();
        counters.record_state_message();
        counters.record_processed();
        counters.add_geometry_calls(3);
        assert_eq!(counters.num_state_messages_received(), 2);
        assert_eq!(counters.num_processed(), 1);
        assert_eq!(counters.num_geometry_calls(), 3);
    }

    #[test]
    fn test_sleeping_gauge() {
        let counters = RuntimeCounters::new();
        counters.inc_sleeping();
        counters.inc_sleeping();
        counters.dec_sleeping();
        assert_eq!(counters.num_sleeping_jobs(), 1);
    }

    #[test]
    fn test_wait_for_observes_updates() {
        let counters = RuntimeCounters::new();
        let c = Arc::clone(&counters);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            c.record_completed();
        });
        assert!(counters.wait_for(
            || counters.num_completed() == 1,
            Duration::from_secs(2)
        ));
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_for_times_out() {
        let counters = RuntimeCounters::new();
        assert!(!counters.wait_for(|| false, Duration::from_millis(10)));
    }
}
