//! Reuse cache: barrier sequences indexed by trajectory-prefix fingerprint.
//!
//! The cache short-circuits recomputation when the robot revisits an
//! equivalent trajectory prefix for an equivalent human sample. Each key
//! holds at most one entry, and at most one build runs per key at a time: a
//! key is claimed before building, and a second consumer parks (job-level)
//! until the first build publishes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::core::{Fingerprint, SegmentIndex};

use super::sequence::BarrierSequence;

/// Cache key: human sample digest, robot segment, and the digest of the
/// first trajectory sample (the prefix seed, stable before a build
/// finishes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub human: Fingerprint,
    pub robot_segment: SegmentIndex,
    pub seed: Fingerprint,
}

/// A published barrier sequence with the rolling fingerprints of the prefix
/// it covers (one per trajectory sample consumed).
#[derive(Debug, Clone)]
pub struct CachedSequence {
    pub prefix_fps: Vec<Fingerprint>,
    pub sequence: BarrierSequence,
}

impl CachedSequence {
    /// Number of trajectory samples the stored sequence consumed.
    pub fn samples_len(&self) -> usize {
        self.prefix_fps.len()
    }
}

#[derive(Debug)]
enum Slot {
    /// A build for this key is in flight; consumers park until publication.
    Building,
    /// A published entry; `rebuilding` guards the single concurrent updater.
    Ready {
        entry: Arc<CachedSequence>,
        rebuilding: bool,
    },
}

/// Outcome of a consumer's first cache consultation.
#[derive(Debug)]
pub enum CacheLookup {
    /// No entry existed; the caller now owns the build latch.
    Claimed,
    /// Another build is in flight; park until it publishes.
    Busy,
    /// A published entry to check for prefix adoption.
    Hit(Arc<CachedSequence>),
}

/// Keyed store of barrier sequences with per-key build latches.
#[derive(Debug, Default)]
pub struct BarrierCache {
    slots: Mutex<HashMap<CacheKey, Slot>>,
}

impl BarrierCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consult the cache; a miss atomically claims the build latch.
    pub fn lookup_or_claim(&self, key: CacheKey) -> CacheLookup {
        let mut slots = self.slots.lock().unwrap();
        match slots.get(&key) {
            None => {
                slots.insert(key, Slot::Building);
                CacheLookup::Claimed
            }
            Some(Slot::Building) => CacheLookup::Busy,
            Some(Slot::Ready { entry, .. }) => CacheLookup::Hit(Arc::clone(entry)),
        }
    }

    /// Claim the right to update an existing entry (or build a missing one).
    /// Returns false when another build or update is already in flight.
    pub fn claim_rebuild(&self, key: CacheKey) -> bool {
        let mut slots = self.slots.lock().unwrap();
        match slots.get_mut(&key) {
            None => {
                slots.insert(key, Slot::Building);
                true
            }
            Some(Slot::Building) => false,
            Some(Slot::Ready { rebuilding, .. }) => {
                if *rebuilding {
                    false
                } else {
                    *rebuilding = true;
                    true
                }
            }
        }
    }

    /// Publish a built sequence, replacing any previous entry for the key.
    pub fn publish(&self, key: CacheKey, entry: CachedSequence) {
        let mut slots = self.slots.lock().unwrap();
        slots.insert(
            key,
            Slot::Ready {
                entry: Arc::new(entry),
                rebuilding: false,
            },
        );
    }

    /// Release a claim without publishing (job cancelled, or an adopter that
    /// ended up not extending the entry).
    pub fn release(&self, key: CacheKey) {
        let mut slots = self.slots.lock().unwrap();
        match slots.get_mut(&key) {
            Some(Slot::Building) => {
                slots.remove(&key);
            }
            Some(Slot::Ready { rebuilding, .. }) => *rebuilding = false,
            None => {}
        }
    }

    /// True when no build latch is held for the key (a parked consumer can
    /// make progress again).
    pub fn latch_released(&self, key: &CacheKey) -> bool {
        let slots = self.slots.lock().unwrap();
        !matches!(slots.get(key), Some(Slot::Building))
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
