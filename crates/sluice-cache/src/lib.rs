//! LRU response cache used by the sluice proxy.
//!
//! [`recency::RecencyList`] keeps the MRU→LRU ordering in an index-linked
//! arena, [`lru::LruCache`] pairs it with a key index for O(1) get/put/evict,
//! and [`manager::CacheManager`] adds request accounting and reporting.

pub mod entry;
pub mod lru;
pub mod manager;
pub mod recency;

pub use entry::{CacheStats, Entry};
pub use lru::LruCache;
pub use manager::{CacheCounters, CacheManager, CacheSnapshot, KeyInfo};
