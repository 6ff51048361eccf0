//! Human state samples.
//!
//! A human state message can carry several candidate positions per keypoint
//! (multi-camera fusion). Each keypoint sample is collapsed to a bounding
//! sphere around the candidate centroid, so downstream geometry stays a
//! single capsule query per segment.

use crate::core::{
    Fingerprint, FingerprintScheme, Point3, SegmentIndex, TimestampType,
};

use super::{Human, Segment};

/// A keypoint position estimate: centroid plus the radius covering all
/// candidate positions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeypointSphere {
    pub centre: Point3,
    pub error: f64,
}

impl KeypointSphere {
    /// Collapse candidate positions to a bounding sphere. Returns `None` for
    /// an empty candidate list.
    pub fn from_candidates(candidates: &[Point3]) -> Option<Self> {
        let centre = Point3::centroid(candidates)?;
        let error = candidates
            .iter()
            .map(|c| c.distance(&centre))
            .fold(0.0, f64::max);
        Some(Self { centre, error })
    }
}

/// A human segment materialised at one instant: the capsule between the two
/// keypoint sphere centres, inflated by the worst keypoint error.
#[derive(Debug, Clone, Copy)]
pub struct HumanSegmentSample {
    pub segment_index: SegmentIndex,
    pub head: KeypointSphere,
    pub tail: KeypointSphere,
    /// Effective capsule radius: thickness plus the larger keypoint error.
    pub radius: f64,
}

impl HumanSegmentSample {
    /// Digest of the sample under the given scheme; used as the human part
    /// of reuse cache keys.
    pub fn fingerprint(&self, scheme: &FingerprintScheme) -> Fingerprint {
        scheme.spheres_digest(&[
            (self.head.centre, self.head.error),
            (self.tail.centre, self.tail.error),
            (Point3::new(self.radius, 0.0, 0.0), 0.0),
        ])
    }
}

/// One human materialised at one timestamp.
#[derive(Debug, Clone)]
pub struct HumanStateInstance {
    pub timestamp: TimestampType,
    /// One sphere per keypoint index; `None` when the sample carried no
    /// candidate for that keypoint.
    pub spheres: Vec<Option<KeypointSphere>>,
}

impl HumanStateInstance {
    /// Build an instance from per-keypoint candidate lists, resolved against
    /// the human descriptor. Keypoints absent from `candidates` stay `None`.
    pub fn new(
        human: &Human,
        timestamp: TimestampType,
        candidates: impl Iterator<Item = (usize, Vec<Point3>)>,
    ) -> Self {
        let mut spheres = vec![None; human.num_points()];
        for (index, points) in candidates {
            if index < spheres.len() {
                let finite: Vec<Point3> =
                    points.into_iter().filter(|p| p.is_finite()).collect();
                spheres[index] = KeypointSphere::from_candidates(&finite);
            }
        }
        Self { timestamp, spheres }
    }

    /// Materialise one segment, if both its keypoints were observed.
    pub fn segment_sample(&self, segment: &Segment) -> Option<HumanSegmentSample> {
        let head = self.spheres.get(usize::from(segment.head)).copied().flatten()?;
        let tail = self.spheres.get(usize::from(segment.tail)).copied().flatten()?;
        Some(HumanSegmentSample {
            segment_index: segment.index,
            head,
            tail,
            radius: segment.thickness + head.error.max(tail.error),
        })
    }
}
