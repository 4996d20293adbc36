//! Per-site result cache for remote reads.
//!
//! This module provides the caching side of the offline core:
//! - Stable keys derived from operation name + normalized parameters
//! - Live/stale entries; invalidation marks stale instead of deleting
//! - Emergency reads that serve a stale value when the network is gone
//! - Single-flight fetches for concurrent misses on the same key

mod key;
mod layer;
mod traits;

pub use key::{CacheKey, QueryKey};
pub use layer::ResultCache;
pub use traits::{CacheEntry, CacheResult, CacheSource, ReadOptions};
