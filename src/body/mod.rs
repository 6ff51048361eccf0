//! Body model: human and robot descriptors.
//!
//! A body is a set of capsule segments over named keypoints, with one
//! thickness (capsule radius) per segment. Descriptors are built once from a
//! `BodyPresentationMessage` and live for the runtime's lifetime.

mod samples;

pub use samples::{HumanSegmentSample, HumanStateInstance, KeypointSphere};

use crate::core::{BodyId, KeypointId, SegmentIndex};
use crate::error::{OperaError, Result};

/// A capsule between two keypoints with a radius (thickness).
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// Index of the segment within its body.
    pub index: SegmentIndex,
    /// Keypoint index of the segment head.
    pub head: u16,
    /// Keypoint index of the segment tail.
    pub tail: u16,
    /// Capsule radius (meters); zero is legal.
    pub thickness: f64,
}

/// Validate a segment topology and produce segment and keypoint-id tables.
///
/// Keypoint ids default to decimal index strings when the presentation does
/// not carry `point_ids`.
fn build_topology(
    body_id: &str,
    segment_pairs: &[(u16, u16)],
    thicknesses: &[f64],
    point_ids: Option<&[KeypointId]>,
) -> Result<(Vec<Segment>, Vec<KeypointId>)> {
    if segment_pairs.is_empty() {
        return Err(OperaError::Config(format!(
            "body {}: no segments in presentation",
            body_id
        )));
    }
    if segment_pairs.len() != thicknesses.len() {
        return Err(OperaError::Config(format!(
            "body {}: {} segment pairs but {} thicknesses",
            body_id,
            segment_pairs.len(),
            thicknesses.len()
        )));
    }
    for (i, t) in thicknesses.iter().enumerate() {
        if !t.is_finite() || *t < 0.0 {
            return Err(OperaError::Config(format!(
                "body {}: segment {} has invalid thickness {}",
                body_id, i, t
            )));
        }
    }

    let max_index = segment_pairs
        .iter()
        .map(|(h, t)| (*h).max(*t))
        .max()
        .unwrap_or(0);

    let keypoint_ids: Vec<KeypointId> = match point_ids {
        Some(ids) => {
            if usize::from(max_index) >= ids.len() {
                return Err(OperaError::Config(format!(
                    "body {}: segment references keypoint {} but only {} point ids given",
                    body_id,
                    max_index,
                    ids.len()
                )));
            }
            ids.to_vec()
        }
        None => (0..=max_index).map(|i| i.to_string()).collect(),
    };

    let segments = segment_pairs
        .iter()
        .zip(thicknesses.iter())
        .enumerate()
        .map(|(i, (&(head, tail), &thickness))| Segment {
            index: i as SegmentIndex,
            head,
            tail,
            thickness,
        })
        .collect();

    Ok((segments, keypoint_ids))
}

/// A human skeleton descriptor.
#[derive(Debug, Clone)]
pub struct Human {
    /// Body identifier from the presentation.
    pub id: BodyId,
    /// Keypoint ids, indexed by keypoint index.
    pub keypoint_ids: Vec<KeypointId>,
    /// Capsule segments.
    pub segments: Vec<Segment>,
}

impl Human {
    /// Build and validate a human descriptor.
    pub fn new(
        id: BodyId,
        segment_pairs: &[(u16, u16)],
        thicknesses: &[f64],
        point_ids: Option<&[KeypointId]>,
    ) -> Result<Self> {
        let (segments, keypoint_ids) =
            build_topology(&id, segment_pairs, thicknesses, point_ids)?;
        Ok(Self {
            id,
            keypoint_ids,
            segments,
        })
    }

    /// Number of distinct keypoints.
    pub fn num_points(&self) -> usize {
        self.keypoint_ids.len()
    }

    /// Resolve a keypoint id to its index.
    pub fn keypoint_index(&self, id: &str) -> Option<usize> {
        self.keypoint_ids.iter().position(|k| k == id)
    }
}

/// A robot kinematic-chain descriptor.
#[derive(Debug, Clone)]
pub struct Robot {
    /// Body identifier from the presentation.
    pub id: BodyId,
    /// Expected state message frequency (Hz).
    pub message_frequency: f64,
    /// Keypoint ids, indexed by keypoint index.
    pub keypoint_ids: Vec<KeypointId>,
    /// Capsule segments.
    pub segments: Vec<Segment>,
}

impl Robot {
    /// Build and validate a robot descriptor.
    pub fn new(
        id: BodyId,
        message_frequency: f64,
        segment_pairs: &[(u16, u16)],
        thicknesses: &[f64],
        point_ids: Option<&[KeypointId]>,
    ) -> Result<Self> {
        if !message_frequency.is_finite() || message_frequency <= 0.0 {
            return Err(OperaError::Config(format!(
                "robot {}: message frequency must be positive, got {}",
                id, message_frequency
            )));
        }
        let (segments, keypoint_ids) =
            build_topology(&id, segment_pairs, thicknesses, point_ids)?;
        Ok(Self {
            id,
            message_frequency,
            keypoint_ids,
            segments,
        })
    }

    /// Number of distinct keypoints.
    pub fn num_points(&self) -> usize {
        self.keypoint_ids.len()
    }

    /// Largest tolerated gap between consecutive samples of one mode run
    /// (nanoseconds): twice the nominal message period.
    pub fn sample_gap_bound_ns(&self) -> u64 {
        (2.0e9 / self.message_frequency).round() as u64
    }
}
