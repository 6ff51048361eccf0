//! Look-ahead jobs: the unit of prediction work.
//!
//! One job pairs a human segment sample with one robot segment and walks the
//! robot's look-ahead trajectory view step by step, folding swept-capsule
//! separations into a barrier sequence. A job completes on the first breach
//! or when its mode run closes; it sleeps when it exhausts the samples
//! available so far, or while another build holds the reuse-cache latch for
//! its key.
//!
//! The two factories differ only in cache residency: a discard job builds
//! from scratch and drops its sequence, a reuse job consults the cache for
//! an equivalent trajectory prefix and registers its result on completion.
//! Both must produce identical collision notifications for the same stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use crate::barriers::{
    BarrierCache, BarrierSequence, BarrierUpdatePolicy, CacheKey, CacheLookup, CachedSequence,
};
use crate::body::{HumanSegmentSample, Segment};
use crate::core::fingerprint::combine;
use crate::core::{
    swept_capsule_distance, Fingerprint, FingerprintScheme, Interval, Mode, ReuseEquivalence,
    SegmentIndex, TimestampType,
};
use crate::error::OperaError;
use crate::history::{RobotStateHistory, TrajectoryView};
use crate::state::RuntimeCounters;

/// Identity of a human/robot segment pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PairKey {
    pub human_segment: SegmentIndex,
    pub robot_segment: SegmentIndex,
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Sleeping,
    Completed,
    Cancelled,
}

/// Why a job is parked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepReason {
    /// The trajectory view has no further samples yet.
    HistoryFrontier { run_index: usize },
    /// Another build holds the reuse-cache latch for this key.
    CacheLatch { key: CacheKey },
}

/// A proven potential collision, ready to become a notification.
#[derive(Debug, Clone)]
pub struct Breach {
    pub pair: PairKey,
    /// Temporal span of the breaching trajectory step.
    pub span: (TimestampType, TimestampType),
    /// Separation bounds of the breaching barrier (meters).
    pub distance: Interval,
    /// Fraction of the separation interval below zero.
    pub likelihood: f64,
    /// Timestamp of the triggering human sample.
    pub current_time: TimestampType,
    /// Robot mode during the prediction.
    pub mode: Mode,
}

/// Result of one worker pass over a job.
#[derive(Debug)]
pub enum JobOutcome {
    Sleep(SleepReason),
    Done(Option<Breach>),
    /// Shutdown observed mid-walk; the job is to be cancelled.
    Interrupted,
    /// An internal invariant failed; fatal for the run.
    Fatal(OperaError),
}

/// Reuse progress of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReuseStage {
    /// Cache not consulted yet.
    Unconsulted,
    /// This job owns the build latch and will publish on completion.
    Building { key: CacheKey },
    /// Adopted a cached prefix; `publishable` when this job also holds the
    /// update claim.
    Adopted {
        key: CacheKey,
        publishable: bool,
        adopted_samples: usize,
    },
    /// Building privately without publishing (update claim unavailable).
    Detached,
}

#[derive(Debug, Clone)]
enum JobVariant {
    Discard,
    Reuse {
        scheme: FingerprintScheme,
        stage: ReuseStage,
    },
}

/// A look-ahead job for one `(human segment, robot segment)` pair.
#[derive(Debug)]
pub struct LookAheadJob {
    /// Job id, assigned by the scheduler at submission.
    pub jid: u64,
    pub pair: PairKey,
    pub state: JobState,
    current_time: TimestampType,
    sample: HumanSegmentSample,
    robot_segment: Segment,
    view: TrajectoryView,
    samples_consumed: usize,
    prefix_fps: Vec<Fingerprint>,
    seq: BarrierSequence,
    variant: JobVariant,
    /// Cache key whose latch this job released during the last advance;
    /// consumed by the scheduler to wake parked consumers.
    pub released_latch: Option<CacheKey>,
}

impl LookAheadJob {
    pub fn view(&self) -> &TrajectoryView {
        &self.view
    }

    pub fn current_time(&self) -> TimestampType {
        self.current_time
    }

    /// Advance this job as far as currently possible.
    pub fn advance(
        &mut self,
        history: &RwLock<RobotStateHistory>,
        cache: &BarrierCache,
        counters: &RuntimeCounters,
        shutdown: &AtomicBool,
    ) -> JobOutcome {
        {
            let h = history.read().unwrap();
            h.extend_view(&mut self.view);
        }

        if let Some(outcome) = self.consult_cache(cache) {
            return outcome;
        }

        loop {
            if self.samples_consumed == 0 && !self.view.is_empty() {
                self.note_sample(0);
                self.samples_consumed = 1;
            }

            while self.samples_consumed < self.view.len() {
                if shutdown.load(Ordering::Relaxed) {
                    self.release_latch(cache);
                    return JobOutcome::Interrupted;
                }
                let i = self.samples_consumed;
                let step = self.view.segment_step(&self.robot_segment, i);
                let (distance, calls) = swept_capsule_distance(
                    &self.sample.head.centre,
                    &self.sample.tail.centre,
                    self.sample.radius,
                    &step,
                    self.robot_segment.thickness,
                );
                counters.add_geometry_calls(calls);
                let span = self.view.step_span(i);
                if let Err(e) = self.seq.observe_step(i, span, distance) {
                    self.release_latch(cache);
                    return JobOutcome::Fatal(e);
                }
                self.note_sample(i);
                self.samples_consumed = i + 1;

                if self.seq.running_min().is_breached() {
                    let breach = self.build_breach();
                    self.finalize_cache(cache);
                    return JobOutcome::Done(Some(breach));
                }
            }

            if self.view.closed {
                self.finalize_cache(cache);
                return JobOutcome::Done(None);
            }

            // The frontier may have moved since the initial refresh; only
            // sleep when there is truly nothing more to consume.
            let grew = {
                let h = history.read().unwrap();
                h.extend_view(&mut self.view) > 0 || self.view.closed
            };
            if !grew {
                return JobOutcome::Sleep(SleepReason::HistoryFrontier {
                    run_index: self.view.run_index,
                });
            }
        }
    }

    /// First-advance cache consultation for reuse jobs. Returns an outcome
    /// only when the job must park on a build latch or an adopted prefix
    /// already proves a breach.
    fn consult_cache(&mut self, cache: &BarrierCache) -> Option<JobOutcome> {
        let scheme = match &self.variant {
            JobVariant::Discard => return None,
            JobVariant::Reuse { scheme, stage } => {
                if *stage != ReuseStage::Unconsulted {
                    return None;
                }
                *scheme
            }
        };
        if self.view.is_empty() {
            return None;
        }

        let key = CacheKey {
            human: self.sample.fingerprint(&scheme),
            robot_segment: self.pair.robot_segment,
            seed: self.view.sample_digest(0, &scheme),
        };

        match cache.lookup_or_claim(key) {
            CacheLookup::Claimed => {
                self.set_stage(ReuseStage::Building { key });
                None
            }
            CacheLookup::Busy => Some(JobOutcome::Sleep(SleepReason::CacheLatch { key })),
            CacheLookup::Hit(entry) => {
                let avail = self.view.len();
                let candidate = avail.min(entry.samples_len());
                self.ensure_fps(candidate);
                let matches = candidate > 0
                    && entry.prefix_fps[candidate - 1] == self.prefix_fps[candidate - 1];

                let adopted = if matches {
                    let mut seq = entry.sequence.clone();
                    if candidate == entry.samples_len()
                        || seq.truncate_to_steps(candidate.saturating_sub(1))
                    {
                        self.seq = seq;
                        self.samples_consumed = candidate;
                        true
                    } else {
                        false
                    }
                } else {
                    false
                };

                if adopted {
                    let publishable = cache.claim_rebuild(key);
                    self.set_stage(ReuseStage::Adopted {
                        key,
                        publishable,
                        adopted_samples: candidate,
                    });
                    if self.seq.running_min().is_breached() {
                        let breach = self.build_breach();
                        self.finalize_cache(cache);
                        return Some(JobOutcome::Done(Some(breach)));
                    }
                } else if cache.claim_rebuild(key) {
                    self.set_stage(ReuseStage::Building { key });
                } else {
                    self.set_stage(ReuseStage::Detached);
                }
                None
            }
        }
    }

    fn set_stage(&mut self, new_stage: ReuseStage) {
        if let JobVariant::Reuse { stage, .. } = &mut self.variant {
            *stage = new_stage;
        }
    }

    /// Compute rolling prefix fingerprints up to `count` samples.
    fn ensure_fps(&mut self, count: usize) {
        let scheme = match &self.variant {
            JobVariant::Reuse { scheme, .. } => *scheme,
            JobVariant::Discard => return,
        };
        while self.prefix_fps.len() < count {
            let i = self.prefix_fps.len();
            let prev = if i == 0 { 0 } else { self.prefix_fps[i - 1] };
            let fp = combine(prev, self.view.sample_digest(i, &scheme));
            self.prefix_fps.push(fp);
        }
    }

    fn note_sample(&mut self, index: usize) {
        self.ensure_fps(index + 1);
    }

    fn build_breach(&self) -> Breach {
        let barrier = self
            .seq
            .earliest_breach()
            .expect("breached running minimum implies a breached barrier");
        Breach {
            pair: self.pair,
            span: barrier.span,
            distance: barrier.distance,
            likelihood: barrier.distance.breach_fraction(),
            current_time: self.current_time,
            mode: self.view.mode.clone(),
        }
    }

    /// Register the finished sequence in the cache (reuse jobs that own a
    /// claim) and remember the released latch for scheduler wake-ups.
    fn finalize_cache(&mut self, cache: &BarrierCache) {
        let stage = match &self.variant {
            JobVariant::Discard => return,
            JobVariant::Reuse { stage, .. } => *stage,
        };
        match stage {
            ReuseStage::Building { key } => {
                cache.publish(
                    key,
                    CachedSequence {
                        prefix_fps: self.prefix_fps[..self.samples_consumed].to_vec(),
                        sequence: self.seq.clone(),
                    },
                );
                self.released_latch = Some(key);
            }
            ReuseStage::Adopted {
                key,
                publishable,
                adopted_samples,
            } => {
                if publishable {
                    if self.samples_consumed > adopted_samples {
                        cache.publish(
                            key,
                            CachedSequence {
                                prefix_fps: self.prefix_fps[..self.samples_consumed].to_vec(),
                                sequence: self.seq.clone(),
                            },
                        );
                    } else {
                        cache.release(key);
                    }
                    self.released_latch = Some(key);
                }
            }
            ReuseStage::Unconsulted | ReuseStage::Detached => {}
        }
    }

    /// Release any held latch without publishing (cancellation path).
    pub fn release_latch(&mut self, cache: &BarrierCache) {
        let stage = match &self.variant {
            JobVariant::Discard => return,
            JobVariant::Reuse { stage, .. } => *stage,
        };
        match stage {
            ReuseStage::Building { key }
            | ReuseStage::Adopted {
                key,
                publishable: true,
                ..
            } => {
                cache.release(key);
                self.released_latch = Some(key);
            }
            _ => {}
        }
    }
}

/// Factory producing the two behaviourally distinct job kinds.
#[derive(Debug, Clone)]
pub enum LookAheadJobFactory {
    /// Build from scratch on every human sample; drop the sequence.
    Discard,
    /// Consult and maintain the reuse cache.
    Reuse {
        policy: BarrierUpdatePolicy,
        scheme: FingerprintScheme,
    },
}

impl LookAheadJobFactory {
    pub fn discard() -> Self {
        Self::Discard
    }

    pub fn reuse(policy: BarrierUpdatePolicy, equivalence: ReuseEquivalence) -> Self {
        Self::Reuse {
            policy,
            scheme: FingerprintScheme {
                equivalence,
                ..FingerprintScheme::default()
            },
        }
    }

    pub fn reuse_with_tolerance(
        policy: BarrierUpdatePolicy,
        equivalence: ReuseEquivalence,
        weak_tolerance: f64,
    ) -> Self {
        Self::Reuse {
            policy,
            scheme: FingerprintScheme::new(equivalence, weak_tolerance),
        }
    }

    /// Materialise one job for a pair over the given view.
    pub fn build(
        &self,
        pair: PairKey,
        sample: HumanSegmentSample,
        current_time: TimestampType,
        robot_segment: Segment,
        view: TrajectoryView,
    ) -> LookAheadJob {
        let (variant, policy) = match self {
            Self::Discard => (
                JobVariant::Discard,
                BarrierUpdatePolicy::KeepOneMinimumDistance,
            ),
            Self::Reuse { policy, scheme } => (
                JobVariant::Reuse {
                    scheme: *scheme,
                    stage: ReuseStage::Unconsulted,
                },
                *policy,
            ),
        };
        LookAheadJob {
            jid: 0,
            pair,
            state: JobState::Queued,
            current_time,
            sample,
            robot_segment,
            view,
            samples_consumed: 0,
            prefix_fps: Vec::new(),
            seq: BarrierSequence::new(policy),
            variant,
            released_latch: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::{Human, HumanStateInstance, Robot};
    use crate::core::{Mode, Point3};
    use std::sync::atomic::AtomicBool;
    use std::sync::RwLock;

    fn fixtures() -> (Human, Robot, RwLock<RobotStateHistory>) {
        let human = Human::new("h0".to_string(), &[(0, 1)], &[0.05], None).unwrap();
        let robot = Robot::new("r0".to_string(), 10.0, &[(0, 1)], &[0.05], None).unwrap();
        let history = RwLock::new(RobotStateHistory::new(robot.sample_gap_bound_ns()));
        (human, robot, history)
    }

    fn human_sample(human: &Human, x: f64) -> HumanSegmentSample {
        let instance = HumanStateInstance::new(
            human,
            1_000_000_000,
            vec![
                (0, vec![Point3::new(x, 0.0, 0.0)]),
                (1, vec![Point3::new(x, 0.0, 1.0)]),
            ]
            .into_iter(),
        );
        instance.segment_sample(&human.segments[0]).unwrap()
    }

    fn robot_points(y: f64) -> Vec<Point3> {
        vec![Point3::new(-0.5, y, 0.0), Point3::new(0.5, y, 0.0)]
    }

    fn advance_ctx(
        job: &mut LookAheadJob,
        history: &RwLock<RobotStateHistory>,
        cache: &BarrierCache,
        counters: &RuntimeCounters,
    ) -> JobOutcome {
        let shutdown = AtomicBool::new(false);
        job.advance(history, cache, counters, &shutdown)
    }

    #[test]
    fn test_job_sleeps_at_frontier_then_completes_on_breach() {
        let (human, robot, history) = fixtures();
        let cache = BarrierCache::new();
        let counters = RuntimeCounters::new();
        let mode = Mode::from_pairs([("motion", "approach")]);

        history
            .write()
            .unwrap()
            .acquire(mode.clone(), robot_points(5.0), 1_000_000_000)
            .unwrap();

        let view = history.read().unwrap().snapshot(1_000_000_000).unwrap();
        let factory = LookAheadJobFactory::discard();
        let pair = PairKey {
            human_segment: 0,
            robot_segment: 0,
        };
        let mut job = factory.build(
            pair,
            human_sample(&human, 0.0),
            1_000_000_000,
            robot.segments[0].clone(),
            view,
        );

        match advance_ctx(&mut job, &history, &cache, &counters) {
            JobOutcome::Sleep(SleepReason::HistoryFrontier { run_index: 0 }) => {}
            other => panic!("expected frontier sleep, got {:?}", other),
        }

        // Robot sweeps through the human position.
        history
            .write()
            .unwrap()
            .acquire(mode.clone(), robot_points(2.0), 1_100_000_000)
            .unwrap();
        history
            .write()
            .unwrap()
            .acquire(mode, robot_points(0.0), 1_200_000_000)
            .unwrap();

        match advance_ctx(&mut job, &history, &cache, &counters) {
            JobOutcome::Done(Some(breach)) => {
                assert!(breach.distance.is_breached());
                assert_eq!(breach.current_time, 1_000_000_000);
                assert!(breach.span.0 >= 1_000_000_000);
                assert!(breach.likelihood >= 0.0 && breach.likelihood <= 1.0);
            }
            other => panic!("expected breach, got {:?}", other),
        }
        assert!(counters.num_geometry_calls() > 0);
    }

    #[test]
    fn test_job_completes_without_breach_on_mode_close() {
        let (human, robot, history) = fixtures();
        let cache = BarrierCache::new();
        let counters = RuntimeCounters::new();
        let mode = Mode::from_pairs([("motion", "far")]);

        {
            let mut h = history.write().unwrap();
            h.acquire(mode.clone(), robot_points(8.0), 1_000_000_000).unwrap();
            h.acquire(mode.clone(), robot_points(8.1), 1_100_000_000).unwrap();
            h.acquire(Mode::empty(), robot_points(8.1), 1_200_000_000).unwrap();
        }

        let view = history.read().unwrap().snapshot(1_000_000_000).unwrap();
        let factory = LookAheadJobFactory::discard();
        let mut job = factory.build(
            PairKey {
                human_segment: 0,
                robot_segment: 0,
            },
            human_sample(&human, 0.0),
            1_000_000_000,
            robot.segments[0].clone(),
            view,
        );

        match advance_ctx(&mut job, &history, &cache, &counters) {
            JobOutcome::Done(None) => {}
            other => panic!("expected clean completion, got {:?}", other),
        }
    }

    #[test]
    fn test_reuse_adopts_cached_prefix_without_geometry() {
        let (human, robot, history) = fixtures();
        let cache = BarrierCache::new();
        let counters = RuntimeCounters::new();
        let mode = Mode::from_pairs([("motion", "pass")]);

        {
            let mut h = history.write().unwrap();
            h.acquire(mode.clone(), robot_points(8.0), 1_000_000_000).unwrap();
            h.acquire(mode.clone(), robot_points(7.5), 1_100_000_000).unwrap();
            h.acquire(Mode::empty(), robot_points(7.5), 1_200_000_000).unwrap();
        }

        let factory = LookAheadJobFactory::reuse(
            BarrierUpdatePolicy::AddWhenDifferentMinimumDistance,
            ReuseEquivalence::Strong,
        );
        let pair = PairKey {
            human_segment: 0,
            robot_segment: 0,
        };

        let view = history.read().unwrap().snapshot(1_000_000_000).unwrap();
        let mut first = factory.build(
            pair,
            human_sample(&human, 0.0),
            1_000_000_000,
            robot.segments[0].clone(),
            view,
        );
        match advance_ctx(&mut first, &history, &cache, &counters) {
            JobOutcome::Done(None) => {}
            other => panic!("expected completion, got {:?}", other),
        }
        assert_eq!(cache.len(), 1);
        let calls_after_first = counters.num_geometry_calls();
        assert!(calls_after_first > 0);

        // Robot revisits the same trajectory prefix in a later run.
        {
            let mut h = history.write().unwrap();
            h.acquire(mode.clone(), robot_points(8.0), 3_000_000_000).unwrap();
            h.acquire(mode.clone(), robot_points(7.5), 3_100_000_000).unwrap();
            h.acquire(Mode::empty(), robot_points(7.5), 3_200_000_000).unwrap();
        }

        let view = history.read().unwrap().snapshot(3_000_000_000).unwrap();
        let mut second = factory.build(
            pair,
            human_sample(&human, 0.0),
            3_000_000_000,
            robot.segments[0].clone(),
            view,
        );
        match advance_ctx(&mut second, &history, &cache, &counters) {
            JobOutcome::Done(None) => {}
            other => panic!("expected completion, got {:?}", other),
        }
        assert_eq!(
            counters.num_geometry_calls(),
            calls_after_first,
            "second build must reuse the cached prefix"
        );
    }

    #[test]
    fn test_second_consumer_parks_on_build_latch() {
        let (human, robot, history) = fixtures();
        let cache = BarrierCache::new();
        let mode = Mode::from_pairs([("motion", "hold")]);

        history
            .write()
            .unwrap()
            .acquire(mode, robot_points(5.0), 1_000_000_000)
            .unwrap();

        let factory = LookAheadJobFactory::reuse(
            BarrierUpdatePolicy::KeepOneMinimumDistance,
            ReuseEquivalence::Strong,
        );
        let pair = PairKey {
            human_segment: 0,
            robot_segment: 0,
        };
        let view = history.read().unwrap().snapshot(1_000_000_000).unwrap();

        let counters = RuntimeCounters::new();
        let mut first = factory.build(
            pair,
            human_sample(&human, 0.0),
            1_000_000_000,
            robot.segments[0].clone(),
            view.clone(),
        );
        // First job claims the latch, then sleeps at the frontier.
        match advance_ctx(&mut first, &history, &cache, &counters) {
            JobOutcome::Sleep(SleepReason::HistoryFrontier { .. }) => {}
            other => panic!("expected frontier sleep, got {:?}", other),
        }

        let mut second = factory.build(
            pair,
            human_sample(&human, 0.0),
            1_000_000_000,
            robot.segments[0].clone(),
            view,
        );
        match advance_ctx(&mut second, &history, &cache, &counters) {
            JobOutcome::Sleep(SleepReason::CacheLatch { key }) => {
                assert!(!cache.latch_released(&key));
            }
            other => panic!("expected cache-latch sleep, got {:?}", other),
        }
    }
}
