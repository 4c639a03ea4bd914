//! Caching layer for offline support.
//!
//! This module provides:
//! - A partitioned, persistent response store ([`CacheStore`], [`SqliteStore`])
//! - Cache-first and network-first serving primitives ([`CacheLayer`])
//! - Age and size bounds for the store ([`EvictionEngine`])
//! - A bounded, time-limited cache of query results ([`ResultCache`])

mod entry;
mod eviction;
mod layer;
mod results;
mod storage;
mod traits;
mod writes;

pub use entry::{CacheEntry, EntryMeta, RequestKey};
pub use eviction::{EvictionEngine, EvictionPolicy, EvictionScheduler, SweepReport};
pub use layer::{CacheLayer, Refill};
pub use results::{normalize_query, ResultCache, ResultCacheEntry, ResultCacheStats};
pub use storage::SqliteStore;
pub use traits::{CacheResult, CacheSource, CacheStore, Partition};
pub use writes::{LastWriteWins, PerKeyLock, WritePolicy};
