//! Barrier-sequence engine: monotone minimum-distance construction and the
//! reuse cache that short-circuits recomputation on trajectory revisits.

mod cache;
mod sequence;

pub use cache::{BarrierCache, CacheKey, CacheLookup, CachedSequence};
pub use sequence::{Barrier, BarrierSequence, BarrierUpdatePolicy};
