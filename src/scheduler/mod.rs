//! Scheduler: fixed-size worker pool dispatching look-ahead jobs.
//!
//! Jobs live in an arena keyed by jid. Dispatch is FIFO, with per
//! `(human segment, robot segment)` pair serialisation: one live job per
//! pair, successors queue in a per-pair backlog and activate in
//! human-arrival order, so per-pair notifications keep their source order.
//! Sleeping jobs are parked either on the history frontier of their run or
//! on a reuse-cache build latch, and woken by the matching event. Workers
//! block on a condition variable; nothing in the pool polls.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;

use crate::barriers::{BarrierCache, CacheKey};
use crate::history::RobotStateHistory;
use crate::jobs::{Breach, JobOutcome, JobState, LookAheadJob, PairKey, SleepReason};
use crate::state::CountersHandle;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of compute workers; 0 selects the hardware concurrency.
    pub concurrency: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { concurrency: 0 }
    }
}

impl SchedulerConfig {
    fn effective_concurrency(&self) -> usize {
        if self.concurrency > 0 {
            self.concurrency
        } else {
            thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

#[derive(Debug, Default)]
struct SchedInner {
    ready: VecDeque<u64>,
    jobs: HashMap<u64, LookAheadJob>,
    sleeping_history: HashMap<usize, Vec<u64>>,
    sleeping_cache: HashMap<CacheKey, Vec<u64>>,
    pair_active: HashMap<PairKey, u64>,
    pair_backlog: HashMap<PairKey, VecDeque<u64>>,
    running_workers: usize,
    next_jid: u64,
}

struct SchedulerShared {
    inner: Mutex<SchedInner>,
    available: Condvar,
    history: Arc<RwLock<RobotStateHistory>>,
    cache: Arc<BarrierCache>,
    counters: CountersHandle,
    /// Breach hand-off to the egress side; cleared at shutdown so the
    /// receiver observes disconnection.
    breach_tx: Mutex<Option<Sender<Breach>>>,
    shutdown: AtomicBool,
    /// Global running flag, cleared on fatal errors.
    running: Arc<AtomicBool>,
}

/// Cloneable access to the pool for ingress-side submission and wake-ups.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<SchedulerShared>,
}

impl SchedulerHandle {
    /// Submit a freshly built job; assigns its jid. Counted as processed.
    pub fn submit(&self, mut job: LookAheadJob) -> u64 {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.next_jid += 1;
        let jid = inner.next_jid;
        job.jid = jid;
        let pair = job.pair;

        job.state = JobState::Queued;
        if inner.pair_active.contains_key(&pair) {
            inner.jobs.insert(jid, job);
            inner.pair_backlog.entry(pair).or_default().push_back(jid);
        } else {
            inner.pair_active.insert(pair, jid);
            inner.jobs.insert(jid, job);
            inner.ready.push_back(jid);
            self.shared.available.notify_one();
        }
        drop(inner);
        self.shared.counters.record_processed();
        jid
    }

    /// Wake jobs sleeping on a history run after new samples or run closure.
    pub fn wake_history(&self, run_index: usize) {
        let mut inner = self.shared.inner.lock().unwrap();
        wake_history_locked(&self.shared, &mut inner, run_index);
    }

    /// True when nothing is queued or running and every outstanding job is
    /// sleeping (completed jobs leave the arena).
    pub fn all_done(&self) -> bool {
        let inner = self.shared.inner.lock().unwrap();
        inner.ready.is_empty()
            && inner.running_workers == 0
            && inner.pair_backlog.values().all(|q| q.is_empty())
            && inner
                .jobs
                .values()
                .all(|j| j.state == JobState::Sleeping)
    }
}

/// Owner of the worker pool.
pub struct JobScheduler {
    shared: Arc<SchedulerShared>,
    workers: Vec<JoinHandle<()>>,
}

impl JobScheduler {
    /// Spawn the pool.
    pub fn new(
        config: SchedulerConfig,
        history: Arc<RwLock<RobotStateHistory>>,
        cache: Arc<BarrierCache>,
        counters: CountersHandle,
        breach_tx: Sender<Breach>,
        running: Arc<AtomicBool>,
    ) -> Self {
        let shared = Arc::new(SchedulerShared {
            inner: Mutex::new(SchedInner::default()),
            available: Condvar::new(),
            history,
            cache,
            counters,
            breach_tx: Mutex::new(Some(breach_tx)),
            shutdown: AtomicBool::new(false),
            running,
        });

        let concurrency = config.effective_concurrency();
        let workers = (0..concurrency)
            .map(|i| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("lookahead-{}", i))
                    .spawn(move || worker_loop(shared))
                    .expect("failed to spawn look-ahead worker")
            })
            .collect();

        log::info!("job scheduler started with {} workers", concurrency);
        Self { shared, workers }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// See [`SchedulerHandle::submit`].
    pub fn submit(&self, job: LookAheadJob) -> u64 {
        self.handle().submit(job)
    }

    /// See [`SchedulerHandle::wake_history`].
    pub fn wake_history(&self, run_index: usize) {
        self.handle().wake_history(run_index)
    }

    /// See [`SchedulerHandle::all_done`].
    pub fn all_done(&self) -> bool {
        self.handle().all_done()
    }

    /// Cancel non-running jobs, let running jobs finish bounded work, and
    /// join the workers. Closes the breach channel.
    pub fn shutdown(mut self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        {
            let mut inner = self.shared.inner.lock().unwrap();
            cancel_parked_locked(&self.shared, &mut inner);
            self.shared.available.notify_all();
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                log::error!("look-ahead worker panicked");
            }
        }
        self.shared.breach_tx.lock().unwrap().take();
        log::info!("job scheduler stopped");
    }
}

/// Cancel every queued and sleeping job; used at shutdown.
fn cancel_parked_locked(shared: &SchedulerShared, inner: &mut SchedInner) {
    let parked: Vec<u64> = inner
        .jobs
        .iter()
        .filter(|(_, j)| j.state != JobState::Running)
        .map(|(jid, _)| *jid)
        .collect();
    for jid in parked {
        if let Some(mut job) = inner.jobs.remove(&jid) {
            if job.state == JobState::Sleeping {
                shared.counters.dec_sleeping();
            }
            job.state = JobState::Cancelled;
            job.release_latch(&shared.cache);
        }
    }
    inner.ready.clear();
    inner.sleeping_history.clear();
    inner.sleeping_cache.clear();
    inner.pair_backlog.clear();
    inner.pair_active.clear();
}

fn wake_history_locked(shared: &SchedulerShared, inner: &mut SchedInner, run_index: usize) {
    if let Some(jids) = inner.sleeping_history.remove(&run_index) {
        for jid in jids {
            if let Some(job) = inner.jobs.get_mut(&jid) {
                job.state = JobState::Queued;
                shared.counters.dec_sleeping();
                inner.ready.push_back(jid);
            }
        }
        shared.available.notify_all();
    }
}

fn wake_cache_locked(shared: &SchedulerShared, inner: &mut SchedInner, key: CacheKey) {
    if let Some(jids) = inner.sleeping_cache.remove(&key) {
        for jid in jids {
            if let Some(job) = inner.jobs.get_mut(&jid) {
                job.state = JobState::Queued;
                shared.counters.dec_sleeping();
                inner.ready.push_back(jid);
            }
        }
        shared.available.notify_all();
    }
}

/// Release the pair slot of a finished job and activate its successor.
fn release_pair_locked(
    shared: &SchedulerShared,
    inner: &mut SchedInner,
    pair: &PairKey,
    jid: u64,
) {
    if inner.pair_active.get(pair) == Some(&jid) {
        inner.pair_active.remove(pair);
        let next = inner
            .pair_backlog
            .get_mut(pair)
            .and_then(|q| q.pop_front());
        if let Some(next_jid) = next {
            inner.pair_active.insert(*pair, next_jid);
            inner.ready.push_back(next_jid);
            shared.available.notify_one();
        }
    }
}

fn worker_loop(shared: Arc<SchedulerShared>) {
    loop {
        let mut job = {
            let mut inner = shared.inner.lock().unwrap();
            let jid = loop {
                if shared.shutdown.load(Ordering::Relaxed) {
                    return;
                }
                if let Some(jid) = inner.ready.pop_front() {
                    break jid;
                }
                inner = shared.available.wait(inner).unwrap();
            };
            let mut job = inner
                .jobs
                .remove(&jid)
                .expect("ready jid present in arena");
            job.state = JobState::Running;
            inner.running_workers += 1;
            job
        };

        let outcome = job.advance(
            &shared.history,
            &shared.cache,
            &shared.counters,
            &shared.shutdown,
        );
        let released = job.released_latch.take();

        let mut inner = shared.inner.lock().unwrap();
        inner.running_workers -= 1;
        if let Some(key) = released {
            wake_cache_locked(&shared, &mut inner, key);
        }

        match outcome {
            JobOutcome::Sleep(reason) => {
                if shared.shutdown.load(Ordering::Relaxed) {
                    job.state = JobState::Cancelled;
                    job.release_latch(&shared.cache);
                    let pair = job.pair;
                    release_pair_locked(&shared, &mut inner, &pair, job.jid);
                    continue;
                }
                // Re-check the wake condition inside the lock; the event may
                // have fired between the advance and this point.
                let stale = match &reason {
                    SleepReason::HistoryFrontier { run_index } => {
                        let h = shared.history.read().unwrap();
                        let (len, closed) = h.frontier(*run_index);
                        closed || len > job.view().start + job.view().len()
                    }
                    SleepReason::CacheLatch { key } => shared.cache.latch_released(key),
                };
                let jid = job.jid;
                if stale {
                    job.state = JobState::Queued;
                    inner.jobs.insert(jid, job);
                    inner.ready.push_back(jid);
                    shared.available.notify_one();
                } else {
                    job.state = JobState::Sleeping;
                    match reason {
                        SleepReason::HistoryFrontier { run_index } => {
                            inner
                                .sleeping_history
                                .entry(run_index)
                                .or_default()
                                .push(jid);
                        }
                        SleepReason::CacheLatch { key } => {
                            inner.sleeping_cache.entry(key).or_default().push(jid);
                        }
                    }
                    inner.jobs.insert(jid, job);
                    shared.counters.inc_sleeping();
                }
            }
            JobOutcome::Done(breach) => {
                job.state = JobState::Completed;
                release_pair_locked(&shared, &mut inner, &job.pair, job.jid);
                drop(inner);
                shared.counters.record_completed();
                if let Some(breach) = breach {
                    shared.counters.record_collision();
                    let tx = shared.breach_tx.lock().unwrap().clone();
                    match tx {
                        Some(tx) => {
                            if tx.send(breach).is_err() {
                                log::warn!("breach channel closed; notification lost");
                            }
                        }
                        None => log::warn!("breach channel closed; notification lost"),
                    }
                }
            }
            JobOutcome::Interrupted => {
                job.state = JobState::Cancelled;
                release_pair_locked(&shared, &mut inner, &job.pair, job.jid);
            }
            JobOutcome::Fatal(e) => {
                log::error!("fatal invariant failure in job {}: {}", job.jid, e);
                release_pair_locked(&shared, &mut inner, &job.pair, job.jid);
                shared.shutdown.store(true, Ordering::Relaxed);
                shared.running.store(false, Ordering::Relaxed);
                shared.available.notify_all();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::{Human, HumanStateInstance, Robot};
    use crate::core::{Mode, Point3};
    use crate::jobs::LookAheadJobFactory;
    use std::time::Duration;

    struct Fixture {
        human: Human,
        robot: Robot,
        history: Arc<RwLock<RobotStateHistory>>,
        cache: Arc<BarrierCache>,
        counters: CountersHandle,
        running: Arc<AtomicBool>,
    }

    fn fixture() -> Fixture {
        let human = Human::new("h0".to_string(), &[(0, 1)], &[0.05], None).unwrap();
        let robot = Robot::new("r0".to_string(), 10.0, &[(0, 1)], &[0.05], None).unwrap();
        let history = Arc::new(RwLock::new(RobotStateHistory::new(
            robot.sample_gap_bound_ns(),
        )));
        Fixture {
            human,
            robot,
            history,
            cache: Arc::new(BarrierCache::new()),
            counters: crate::state::RuntimeCounters::new(),
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    fn build_job(f: &Fixture, anchor: u64) -> LookAheadJob {
        let instance = HumanStateInstance::new(
            &f.human,
            anchor,
            vec![
                (0, vec![Point3::new(0.0, 0.0, 0.0)]),
                (1, vec![Point3::new(0.0, 0.0, 1.0)]),
            ]
            .into_iter(),
        );
        let sample = instance.segment_sample(&f.human.segments[0]).unwrap();
        let view = f.history.read().unwrap().snapshot(anchor).unwrap();
        LookAheadJobFactory::discard().build(
            PairKey {
                human_segment: 0,
                robot_segment: 0,
            },
            sample,
            anchor,
            f.robot.segments[0].clone(),
            view,
        )
    }

    fn approach(y: f64) -> Vec<Point3> {
        vec![Point3::new(-0.5, y, 0.0), Point3::new(0.5, y, 0.0)]
    }

    #[test]
    fn test_sleeping_job_wakes_and_breaches() {
        let f = fixture();
        let (tx, rx) = crossbeam_channel::unbounded();
        let scheduler = JobScheduler::new(
            SchedulerConfig { concurrency: 2 },
            Arc::clone(&f.history),
            Arc::clone(&f.cache),
            Arc::clone(&f.counters),
            tx,
            Arc::clone(&f.running),
        );

        let mode = Mode::from_pairs([("motion", "approach")]);
        f.history
            .write()
            .unwrap()
            .acquire(mode.clone(), approach(5.0), 1_000)
            .unwrap();

        scheduler.submit(build_job(&f, 1_000));
        assert!(f
            .counters
            .wait_for(|| f.counters.num_sleeping_jobs() == 1, Duration::from_secs(5)));

        let outcome = f
            .history
            .write()
            .unwrap()
            .acquire(mode, approach(0.0), 100_001_000)
            .unwrap();
        scheduler.wake_history(outcome.run_index);

        let breach = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(breach.distance.is_breached());
        assert_eq!(f.counters.num_collisions(), 1);
        assert!(f
            .counters
            .wait_for(|| scheduler.all_done(), Duration::from_secs(5)));
        scheduler.shutdown();
    }

    #[test]
    fn test_pair_serialisation_keeps_arrival_order() {
        let f = fixture();
        let (tx, rx) = crossbeam_channel::unbounded();
        let scheduler = JobScheduler::new(
            SchedulerConfig { concurrency: 4 },
            Arc::clone(&f.history),
            Arc::clone(&f.cache),
            Arc::clone(&f.counters),
            tx,
            Arc::clone(&f.running),
        );

        // Breaching trajectory already fully available and closed.
        {
            let mut h = f.history.write().unwrap();
            h.acquire(
                Mode::from_pairs([("motion", "hit")]),
                approach(1.0),
                1_000,
            )
            .unwrap();
            h.acquire(
                Mode::from_pairs([("motion", "hit")]),
                approach(0.0),
                100_000_000,
            )
            .unwrap();
            h.acquire(Mode::empty(), approach(0.0), 200_000_000).unwrap();
        }

        for anchor in [1_000u64, 2_000, 3_000] {
            scheduler.submit(build_job(&f, anchor));
        }

        let mut times = Vec::new();
        for _ in 0..3 {
            times.push(rx.recv_timeout(Duration::from_secs(5)).unwrap().current_time);
        }
        assert_eq!(times, vec![1_000, 2_000, 3_000]);
        scheduler.shutdown();
    }

    #[test]
    fn test_shutdown_cancels_sleeping_jobs() {
        let f = fixture();
        let (tx, _rx) = crossbeam_channel::unbounded();
        let scheduler = JobScheduler::new(
            SchedulerConfig { concurrency: 1 },
            Arc::clone(&f.history),
            Arc::clone(&f.cache),
            Arc::clone(&f.counters),
            tx,
            Arc::clone(&f.running),
        );

        f.history
            .write()
            .unwrap()
            .acquire(Mode::from_pairs([("m", "a")]), approach(5.0), 1_000)
            .unwrap();
        scheduler.submit(build_job(&f, 1_000));
        assert!(f
            .counters
            .wait_for(|| f.counters.num_sleeping_jobs() == 1, Duration::from_secs(5)));

        scheduler.shutdown();
        assert_eq!(f.counters.num_sleeping_jobs(), 0);
        assert_eq!(f.counters.num_completed(), 0);
    }
}
