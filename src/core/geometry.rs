//! Geometry kernel: capsule and sphere separation distances.
//!
//! All operations are pure and deterministic. Distances between swept
//! capsules are returned as [`Interval`]s whose width reflects the temporal
//! span of the trajectory step; instantaneous distances are degenerate
//! intervals.

use serde::{Deserialize, Serialize};

use super::interval::Interval;

/// A point in 3D workcell coordinates (meters).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Point3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// All coordinates are finite.
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    pub fn sub(&self, other: &Point3) -> Point3 {
        Point3::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }

    pub fn add(&self, other: &Point3) -> Point3 {
        Point3::new(self.x + other.x, self.y + other.y, self.z + other.z)
    }

    pub fn scale(&self, s: f64) -> Point3 {
        Point3::new(self.x * s, self.y * s, self.z * s)
    }

    pub fn dot(&self, other: &Point3) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn norm(&self) -> f64 {
        self.dot(self).sqrt()
    }

    pub fn distance(&self, other: &Point3) -> f64 {
        self.sub(other).norm()
    }

    /// Midpoint between two points.
    pub fn midpoint(&self, other: &Point3) -> Point3 {
        self.add(other).scale(0.5)
    }

    /// Centroid of a non-empty slice of points.
    pub fn centroid(points: &[Point3]) -> Option<Point3> {
        if points.is_empty() {
            return None;
        }
        let mut acc = Point3::new(0.0, 0.0, 0.0);
        for p in points {
            acc = acc.add(p);
        }
        Some(acc.scale(1.0 / points.len() as f64))
    }
}

impl From<[f64; 3]> for Point3 {
    fn from(v: [f64; 3]) -> Self {
        Point3::new(v[0], v[1], v[2])
    }
}

impl From<Point3> for [f64; 3] {
    fn from(p: Point3) -> Self {
        [p.x, p.y, p.z]
    }
}

/// Squared-length threshold below which a segment is treated as a point.
const DEGENERATE_EPSILON: f64 = 1e-12;

/// Distance from point `p` to segment `[q0, q1]`.
pub fn point_segment_distance(p: &Point3, q0: &Point3, q1: &Point3) -> f64 {
    let d = q1.sub(q0);
    let len_sq = d.dot(&d);
    if len_sq < DEGENERATE_EPSILON {
        return p.distance(q0);
    }
    let t = (p.sub(q0).dot(&d) / len_sq).clamp(0.0, 1.0);
    p.distance(&q0.add(&d.scale(t)))
}

/// Minimum distance between segments `[p0, p1]` and `[q0, q1]`.
///
/// Standard clamped closest-point computation; handles degenerate segments
/// (points) through the same parameterisation.
pub fn segment_segment_distance(p0: &Point3, p1: &Point3, q0: &Point3, q1: &Point3) -> f64 {
    let d1 = p1.sub(p0);
    let d2 = q1.sub(q0);
    let r = p0.sub(q0);
    let a = d1.dot(&d1);
    let e = d2.dot(&d2);
    let f = d2.dot(&r);

    if a < DEGENERATE_EPSILON && e < DEGENERATE_EPSILON {
        return p0.distance(q0);
    }
    if a < DEGENERATE_EPSILON {
        return point_segment_distance(p0, q0, q1);
    }
    if e < DEGENERATE_EPSILON {
        return point_segment_distance(q0, p0, p1);
    }

    let c = d1.dot(&r);
    let b = d1.dot(&d2);
    let denom = a * e - b * b;

    // Closest point on [p0,p1] to the infinite line through [q0,q1],
    // clamped to the segment; parallel segments pick an arbitrary s.
    let mut s = if denom.abs() > DEGENERATE_EPSILON {
        ((b * f - c * e) / denom).clamp(0.0, 1.0)
    } else {
        0.0
    };

    let mut t = (b * s + f) / e;
    if t < 0.0 {
        t = 0.0;
        s = (-c / a).clamp(0.0, 1.0);
    } else if t > 1.0 {
        t = 1.0;
        s = ((b - c) / a).clamp(0.0, 1.0);
    }

    let cp = p0.add(&d1.scale(s));
    let cq = q0.add(&d2.scale(t));
    cp.distance(&cq)
}

/// Separation between two static capsules: axis distance minus both radii.
///
/// The result is a degenerate interval; it goes negative on penetration.
pub fn capsule_distance(
    p0: &Point3,
    p1: &Point3,
    r_a: f64,
    q0: &Point3,
    q1: &Point3,
    r_b: f64,
) -> Interval {
    Interval::point(segment_segment_distance(p0, p1, q0, q1) - r_a - r_b)
}

/// Separation between a sphere `(p, r_a)` and a capsule `[q0, q1]` of radius
/// `r_b`.
pub fn point_sphere_distance(p: &Point3, q0: &Point3, q1: &Point3, r: f64) -> Interval {
    Interval::point(point_segment_distance(p, q0, q1) - r)
}

/// One trajectory step of a robot segment: both endpoints at the start and
/// at the end of the step.
#[derive(Debug, Clone, Copy)]
pub struct SegmentStep {
    pub head_start: Point3,
    pub tail_start: Point3,
    pub head_end: Point3,
    pub tail_end: Point3,
}

/// Separation interval between a fixed capsule and a robot segment swept
/// across one trajectory step.
///
/// The swept axis is enclosed in the capsule around the mid-step axis,
/// inflated by half the largest endpoint motion; the lower bound subtracts
/// that inflation, the upper bound is the tighter of the two instantaneous
/// step-endpoint separations. Returns the interval together with the number
/// of kernel evaluations spent, so callers can account geometry work.
pub fn swept_capsule_distance(
    p0: &Point3,
    p1: &Point3,
    r_a: f64,
    step: &SegmentStep,
    r_b: f64,
) -> (Interval, u64) {
    let head_mid = step.head_start.midpoint(&step.head_end);
    let tail_mid = step.tail_start.midpoint(&step.tail_end);
    let motion = step
        .head_start
        .distance(&step.head_end)
        .max(step.tail_start.distance(&step.tail_end))
        / 2.0;

    let degenerate = p0.distance(p1) * p0.distance(p1) < DEGENERATE_EPSILON;

    let (d_start, d_end, d_mid) = if degenerate {
        (
            point_sphere_distance(p0, &step.head_start, &step.tail_start, r_b).lower - r_a,
            point_sphere_distance(p0, &step.head_end, &step.tail_end, r_b).lower - r_a,
            point_sphere_distance(p0, &head_mid, &tail_mid, r_b).lower - r_a,
        )
    } else {
        (
            capsule_distance(p0, p1, r_a, &step.head_start, &step.tail_start, r_b).lower,
            capsule_distance(p0, p1, r_a, &step.head_end, &step.tail_end, r_b).lower,
            capsule_distance(p0, p1, r_a, &head_mid, &tail_mid, r_b).lower,
        )
    };

    let upper = d_start.min(d_end);
    let lower = (d_mid - motion).min(upper);
    (Interval::new(lower, upper), 3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_point_segment_distance() {
        let q0 = Point3::new(0.0, 0.0, 0.0);
        let q1 = Point3::new(1.0, 0.0, 0.0);
        assert_relative_eq!(
            point_segment_distance(&Point3::new(0.5, 1.0, 0.0), &q0, &q1),
            1.0
        );
        assert_relative_eq!(
            point_segment_distance(&Point3::new(2.0, 0.0, 0.0), &q0, &q1),
            1.0
        );
    }

    #[test]
    fn test_segment_segment_parallel() {
        let d = segment_segment_distance(
            &Point3::new(0.0, 0.0, 0.0),
            &Point3::new(1.0, 0.0, 0.0),
            &Point3::new(0.0, 2.0, 0.0),
            &Point3::new(1.0, 2.0, 0.0),
        );
        assert_relative_eq!(d, 2.0);
    }

    #[test]
    fn test_segment_segment_crossing() {
        let d = segment_segment_distance(
            &Point3::new(-1.0, 0.0, 0.0),
            &Point3::new(1.0, 0.0, 0.0),
            &Point3::new(0.0, -1.0, 1.0),
            &Point3::new(0.0, 1.0, 1.0),
        );
        assert_relative_eq!(d, 1.0);
    }

    #[test]
    fn test_segment_degenerate_to_point() {
        let p = Point3::new(0.0, 3.0, 0.0);
        let d = segment_segment_distance(
            &p,
            &p,
            &Point3::new(-1.0, 0.0, 0.0),
            &Point3::new(1.0, 0.0, 0.0),
        );
        assert_relative_eq!(d, 3.0);
    }

    #[test]
    fn test_capsule_distance_penetration_is_negative() {
        let d = capsule_distance(
            &Point3::new(0.0, 0.0, 0.0),
            &Point3::new(1.0, 0.0, 0.0),
            0.3,
            &Point3::new(0.0, 0.4, 0.0),
            &Point3::new(1.0, 0.4, 0.0),
            0.3,
        );
        assert!(d.is_breached());
        assert_relative_eq!(d.lower, -0.2);
    }

    #[test]
    fn test_zero_thickness_coincident_points_breach() {
        let p = Point3::new(0.5, 0.0, 0.0);
        let d = capsule_distance(
            &p,
            &p,
            0.0,
            &Point3::new(0.0, 0.0, 0.0),
            &Point3::new(1.0, 0.0, 0.0),
            0.0,
        );
        assert!(d.is_breached());
    }

    #[test]
    fn test_swept_step_bounds_contain_instantaneous() {
        let p0 = Point3::new(0.0, 1.0, 0.0);
        let p1 = Point3::new(0.5, 1.0, 0.0);
        let step = SegmentStep {
            head_start: Point3::new(-1.0, -1.0, 0.0),
            tail_start: Point3::new(1.0, -1.0, 0.0),
            head_end: Point3::new(-1.0, -0.5, 0.0),
            tail_end: Point3::new(1.0, -0.5, 0.0),
        };
        let (d, calls) = swept_capsule_distance(&p0, &p1, 0.1, &step, 0.1);
        assert_eq!(calls, 3);
        // End pose is the nearer one: 1.5 axis distance minus radii.
        assert_relative_eq!(d.upper, 1.3);
        assert!(d.lower <= d.upper);
        // Lower bound covers the whole sweep.
        assert!(d.lower <= 1.3 && d.lower >= 1.0);
    }

    #[test]
    fn test_point_sphere_distance() {
        let d = point_sphere_distance(
            &Point3::new(0.0, 2.0, 0.0),
            &Point3::new(-1.0, 0.0, 0.0),
            &Point3::new(1.0, 0.0, 0.0),
            0.5,
        );
        assert_relative_eq!(d.lower, 1.5);
    }
}
