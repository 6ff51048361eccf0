//! Robot state history: time-indexed, mode-segmented trajectory store.
//!
//! The history is the single structure the ingress side writes and every
//! worker reads. Writers append through [`RobotStateHistory::acquire`];
//! readers take [`TrajectoryView`] snapshots that share the stored samples
//! (`Arc`) and stay valid while the history keeps growing, so no barrier
//! build ever holds the writer lock.

use std::sync::Arc;

use crate::body::Segment;
use crate::core::fingerprint::combine;
use crate::core::{Fingerprint, FingerprintScheme, Mode, Point3, SegmentStep, TimestampType};
use crate::error::{OperaError, Result};

/// One robot sample: a point per keypoint at a timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct TrajectorySample {
    pub timestamp: TimestampType,
    /// One point per robot keypoint index.
    pub points: Vec<Point3>,
}

/// A maximal run of samples sharing one mode without oversized gaps.
#[derive(Debug)]
struct ModeRun {
    mode: Mode,
    samples: Vec<Arc<TrajectorySample>>,
}

/// Result of a successful [`RobotStateHistory::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireOutcome {
    /// Run the sample landed in.
    pub run_index: usize,
    /// Index of the sample within its run.
    pub sample_index: usize,
    /// True when the sample opened a new mode run (mode change or gap).
    pub opened_new_run: bool,
}

/// Mode-segmented robot trajectory store. Entries never shrink during a run.
#[derive(Debug)]
pub struct RobotStateHistory {
    runs: Vec<ModeRun>,
    gap_bound_ns: u64,
}

impl RobotStateHistory {
    /// Create an empty history with the given inter-sample gap bound
    /// (nanoseconds); a larger gap forces a mode break.
    pub fn new(gap_bound_ns: u64) -> Self {
        Self {
            runs: Vec::new(),
            gap_bound_ns,
        }
    }

    /// Update the gap bound once the robot's message frequency is known.
    pub fn set_gap_bound(&mut self, gap_bound_ns: u64) {
        self.gap_bound_ns = gap_bound_ns;
    }

    /// Timestamp of the newest sample, if any.
    pub fn last_timestamp(&self) -> Option<TimestampType> {
        self.runs
            .last()
            .and_then(|r| r.samples.last())
            .map(|s| s.timestamp)
    }

    /// Mode of the newest run, if any.
    pub fn current_mode(&self) -> Option<&Mode> {
        self.runs.last().map(|r| &r.mode)
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn num_runs(&self) -> usize {
        self.runs.len()
    }

    /// Insert a sample. Fails with `OutOfOrder` when the timestamp does not
    /// advance past the newest stored sample; opens a new mode run when the
    /// mode changes or the gap exceeds the bound.
    pub fn acquire(
        &mut self,
        mode: Mode,
        points: Vec<Point3>,
        timestamp: TimestampType,
    ) -> Result<AcquireOutcome> {
        if let Some(last) = self.last_timestamp() {
            if timestamp <= last {
                return Err(OperaError::OutOfOrder { timestamp });
            }
        }

        let sample = Arc::new(TrajectorySample { timestamp, points });

        let open_new = match self.runs.last() {
            None => true,
            Some(run) => {
                let last = run
                    .samples
                    .last()
                    .map(|s| s.timestamp)
                    .unwrap_or(timestamp);
                run.mode != mode || timestamp - last > self.gap_bound_ns
            }
        };

        if open_new {
            self.runs.push(ModeRun {
                mode,
                samples: vec![sample],
            });
            Ok(AcquireOutcome {
                run_index: self.runs.len() - 1,
                sample_index: 0,
                opened_new_run: true,
            })
        } else {
            let run_index = self.runs.len() - 1;
            let run = self.runs.last_mut().expect("non-empty runs");
            run.samples.push(sample);
            Ok(AcquireOutcome {
                run_index,
                sample_index: run.samples.len() - 1,
                opened_new_run: false,
            })
        }
    }

    /// Snapshot the look-ahead window anchored at `t_anchor`: the samples
    /// from the greatest one at or before the anchor, forward to the end of
    /// its mode run. Returns `None` when no sample precedes the anchor.
    pub fn snapshot(&self, t_anchor: TimestampType) -> Option<TrajectoryView> {
        for (run_index, run) in self.runs.iter().enumerate().rev() {
            let first = run.samples.first()?.timestamp;
            if first > t_anchor {
                continue;
            }
            let start = run
                .samples
                .partition_point(|s| s.timestamp <= t_anchor)
                .saturating_sub(1);
            return Some(TrajectoryView {
                run_index,
                start,
                mode: run.mode.clone(),
                samples: run.samples[start..].to_vec(),
                closed: run_index + 1 < self.runs.len(),
            });
        }
        None
    }

    /// Pull newly acquired samples into an existing view. Returns the number
    /// of samples appended; also marks the view closed once its run has a
    /// successor.
    pub fn extend_view(&self, view: &mut TrajectoryView) -> usize {
        let run = &self.runs[view.run_index];
        let have = view.start + view.samples.len();
        let appended = run.samples.len().saturating_sub(have);
        if appended > 0 {
            view.samples.extend_from_slice(&run.samples[have..]);
        }
        view.closed = view.run_index + 1 < self.runs.len();
        appended
    }

    /// Current length and closed-ness of a run, for wake-up rechecks.
    pub fn frontier(&self, run_index: usize) -> (usize, bool) {
        (
            self.runs[run_index].samples.len(),
            run_index + 1 < self.runs.len(),
        )
    }
}

/// Immutable snapshot of a look-ahead window.
///
/// Holds shared references to the stored samples; stays valid as the history
/// grows and is refreshed through [`RobotStateHistory::extend_view`].
#[derive(Debug, Clone)]
pub struct TrajectoryView {
    /// Run this view reads from.
    pub run_index: usize,
    /// Absolute index of the first sample within the run.
    pub start: usize,
    /// Mode of the run.
    pub mode: Mode,
    samples: Vec<Arc<TrajectorySample>>,
    /// True once the run has a successor (the window cannot grow further).
    pub closed: bool,
}

impl TrajectoryView {
    /// Number of samples currently visible.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn sample(&self, i: usize) -> &TrajectorySample {
        &self.samples[i]
    }

    /// Temporal span of step `i` (from sample `i-1` to sample `i`).
    pub fn step_span(&self, i: usize) -> (TimestampType, TimestampType) {
        (self.samples[i - 1].timestamp, self.samples[i].timestamp)
    }

    /// Endpoint motion of a robot segment across step `i`.
    pub fn segment_step(&self, segment: &Segment, i: usize) -> SegmentStep {
        let before = &self.samples[i - 1];
        let after = &self.samples[i];
        SegmentStep {
            head_start: before.points[usize::from(segment.head)],
            tail_start: before.points[usize::from(segment.tail)],
            head_end: after.points[usize::from(segment.head)],
            tail_end: after.points[usize::from(segment.tail)],
        }
    }

    /// Digest of sample `i` under the scheme (points only, so revisits of
    /// the same motion at different wall times fingerprint identically).
    pub fn sample_digest(&self, i: usize, scheme: &FingerprintScheme) -> Fingerprint {
        scheme.points_digest(&self.samples[i].points)
    }

    /// Rolling fingerprint of the whole visible prefix.
    pub fn fingerprint(&self, scheme: &FingerprintScheme) -> Fingerprint {
        let mut fp = 0;
        for i in 0..self.samples.len() {
            fp = combine(fp, self.sample_digest(i, scheme));
        }
        fp
    }
}
