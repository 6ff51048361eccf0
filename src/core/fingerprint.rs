//! Stable digests over point data under a selectable equivalence.
//!
//! Fingerprints let the reuse machinery decide that two trajectory prefixes
//! (or two human samples) are equivalent without touching the geometry
//! kernel. STRONG equivalence digests the exact f64 bit patterns, so equal
//! fingerprints imply bit-identical distance results; WEAK equivalence
//! quantises coordinates onto a tolerance grid first.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use super::geometry::Point3;

/// Digest type for sample and prefix fingerprints.
pub type Fingerprint = u64;

/// Equivalence relation used when fingerprinting points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReuseEquivalence {
    /// Exact equality of coordinate bit patterns.
    Strong,
    /// Equality up to a quantisation tolerance.
    Weak,
}

/// Fingerprinting parameters: the equivalence plus the WEAK grid tolerance.
#[derive(Debug, Clone, Copy)]
pub struct FingerprintScheme {
    pub equivalence: ReuseEquivalence,
    /// Grid step (meters) for WEAK quantisation.
    pub weak_tolerance: f64,
}

impl Default for FingerprintScheme {
    fn default() -> Self {
        Self {
            equivalence: ReuseEquivalence::Strong,
            weak_tolerance: 1e-3,
        }
    }
}

impl FingerprintScheme {
    pub fn new(equivalence: ReuseEquivalence, weak_tolerance: f64) -> Self {
        Self {
            equivalence,
            weak_tolerance,
        }
    }

    fn write_coord<H: Hasher>(&self, hasher: &mut H, value: f64) {
        match self.equivalence {
            ReuseEquivalence::Strong => value.to_bits().hash(hasher),
            ReuseEquivalence::Weak => {
                ((value / self.weak_tolerance).round() as i64).hash(hasher)
            }
        }
    }

    fn write_point<H: Hasher>(&self, hasher: &mut H, point: &Point3) {
        self.write_coord(hasher, point.x);
        self.write_coord(hasher, point.y);
        self.write_coord(hasher, point.z);
    }

    /// Digest of a point set (for example one trajectory sample).
    pub fn points_digest(&self, points: &[Point3]) -> Fingerprint {
        let mut hasher = DefaultHasher::new();
        points.len().hash(&mut hasher);
        for p in points {
            self.write_point(&mut hasher, p);
        }
        hasher.finish()
    }

    /// Digest of `(point, radius)` pairs (for example human keypoint
    /// spheres).
    pub fn spheres_digest(&self, spheres: &[(Point3, f64)]) -> Fingerprint {
        let mut hasher = DefaultHasher::new();
        spheres.len().hash(&mut hasher);
        for (p, r) in spheres {
            self.write_point(&mut hasher, p);
            self.write_coord(&mut hasher, *r);
        }
        hasher.finish()
    }
}

/// Roll a sample digest into a prefix fingerprint.
pub fn combine(prefix: Fingerprint, digest: Fingerprint) -> Fingerprint {
    let mut hasher = DefaultHasher::new();
    prefix.hash(&mut hasher);
    digest.hash(&mut hasher);
    hasher.finish()
}
