//! Monotone minimum-distance barrier sequences.
//!
//! A worker walking a trajectory view observes one separation interval per
//! step and folds it into a running minimum. The update policy decides which
//! intermediate minima are materialised as barriers; either way the running
//! minimum only tightens, and the earliest breached barrier carries the
//! predicted collision span.

use crate::core::{Interval, TimestampType, DISTANCE_EPSILON};
use crate::error::{OperaError, Result};

/// Policy deciding when a new barrier is admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierUpdatePolicy {
    /// Keep a single barrier: replace the tail whenever a step tightens the
    /// running minimum.
    KeepOneMinimumDistance,
    /// Append a barrier whenever the running minimum changes beyond the
    /// distance epsilon, producing a monotone staircase.
    AddWhenDifferentMinimumDistance,
}

/// An interval-valued minimum over a trajectory prefix, together with the
/// temporal span of the step that achieved it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Barrier {
    /// 1-based index of the last step covered by this barrier's prefix.
    pub step: usize,
    /// Temporal span of the minimum-achieving step.
    pub span: (TimestampType, TimestampType),
    /// Bounds on the minimum separation across the prefix.
    pub distance: Interval,
}

impl Barrier {
    /// True when this barrier proves a potential collision.
    pub fn is_breached(&self) -> bool {
        self.distance.is_breached()
    }
}

/// Ordered barriers covering successively longer prefixes of one trajectory
/// view, for one `(human segment, robot segment)` pair.
#[derive(Debug, Clone)]
pub struct BarrierSequence {
    policy: BarrierUpdatePolicy,
    barriers: Vec<Barrier>,
    steps_covered: usize,
    running_min: Interval,
}

impl BarrierSequence {
    pub fn new(policy: BarrierUpdatePolicy) -> Self {
        Self {
            policy,
            barriers: Vec::new(),
            steps_covered: 0,
            running_min: Interval::UNBOUNDED,
        }
    }

    pub fn policy(&self) -> BarrierUpdatePolicy {
        self.policy
    }

    /// Number of trajectory steps folded in so far.
    pub fn steps_covered(&self) -> usize {
        self.steps_covered
    }

    /// Current bounds on the minimum over the covered prefix.
    pub fn running_min(&self) -> Interval {
        self.running_min
    }

    pub fn barriers(&self) -> &[Barrier] {
        &self.barriers
    }

    pub fn len(&self) -> usize {
        self.barriers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.barriers.is_empty()
    }

    /// Fold in the separation interval observed across step `step`
    /// (1-based, contiguous).
    pub fn observe_step(
        &mut self,
        step: usize,
        span: (TimestampType, TimestampType),
        distance: Interval,
    ) -> Result<()> {
        if step != self.steps_covered + 1 {
            return Err(OperaError::InternalInvariant(format!(
                "barrier step {} observed after {} covered steps",
                step, self.steps_covered
            )));
        }

        let new_min = self.running_min.min(&distance);
        if new_min.lower > self.running_min.lower + DISTANCE_EPSILON
            || new_min.upper > self.running_min.upper + DISTANCE_EPSILON
        {
            return Err(OperaError::InternalInvariant(format!(
                "running minimum widened at step {}",
                step
            )));
        }

        let tightened = new_min.differs_from(&self.running_min, DISTANCE_EPSILON);
        match self.policy {
            BarrierUpdatePolicy::KeepOneMinimumDistance => {
                if tightened || self.barriers.is_empty() {
                    self.barriers.clear();
                    self.barriers.push(Barrier {
                        step,
                        span,
                        distance: new_min,
                    });
                }
            }
            BarrierUpdatePolicy::AddWhenDifferentMinimumDistance => {
                if tightened || self.barriers.is_empty() {
                    if let Some(tail) = self.barriers.last() {
                        if new_min.lower > tail.distance.lower + DISTANCE_EPSILON {
                            return Err(OperaError::InternalInvariant(format!(
                                "non-monotone barrier appended at step {}",
                                step
                            )));
                        }
                    }
                    self.barriers.push(Barrier {
                        step,
                        span,
                        distance: new_min,
                    });
                }
            }
        }

        self.running_min = new_min;
        self.steps_covered = step;
        Ok(())
    }

    /// The earliest barrier proving a potential collision.
    pub fn earliest_breach(&self) -> Option<&Barrier> {
        self.barriers.iter().find(|b| b.is_breached())
    }

    /// Shrink the sequence to cover exactly `steps` steps.
    ///
    /// Returns false when the policy cannot reconstruct the intermediate
    /// state (`KeepOne` holds only the final minimum, so anything but a
    /// whole-prefix match is unrecoverable).
    pub fn truncate_to_steps(&mut self, steps: usize) -> bool {
        if steps >= self.steps_covered {
            return steps == self.steps_covered;
        }
        match self.policy {
            BarrierUpdatePolicy::KeepOneMinimumDistance => false,
            BarrierUpdatePolicy::AddWhenDifferentMinimumDistance => {
                self.barriers.retain(|b| b.step <= steps);
                self.running_min = self
                    .barriers
                    .last()
                    .map(|b| b.distance)
                    .unwrap_or(Interval::UNBOUNDED);
                self.steps_covered = steps;
                true
            }
        }
    }
}
