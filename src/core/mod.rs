//! Foundation layer: identifiers, interval arithmetic, geometry kernel.

pub mod fingerprint;
pub mod geometry;
pub mod interval;
pub mod types;

pub use fingerprint::{Fingerprint, FingerprintScheme, ReuseEquivalence};
pub use geometry::{
    capsule_distance, point_segment_distance, point_sphere_distance, segment_segment_distance,
    swept_capsule_distance, Point3, SegmentStep,
};
pub use interval::{Interval, DISTANCE_EPSILON};
pub use types::{BodyId, KeypointId, Mode, SegmentIndex, TimestampType};
