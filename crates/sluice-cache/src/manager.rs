use crate::entry::{CacheStats, Entry};
use crate::lru::LruCache;
use bytes::Bytes;
use serde::Serialize;

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

/// Per-process owner of the response cache.
///
/// Wraps one [`LruCache`] and counts read traffic on its own: every `get`
/// bumps `total_requests` and exactly one of `hits`/`misses`, so
/// `total_requests == hits + misses` always holds. Writes are not counted.
///
/// One instance is built at startup and handed to the request path; workers
/// in a multi-process deployment each own a separate instance.
pub struct CacheManager {
    cache: LruCache,
    hits: u64,
    misses: u64,
    total_requests: u64,
}

/// Point-in-time report of the cache, serialized for the status API and the
/// telemetry socket.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSnapshot {
    pub size: usize,
    pub limit: usize,
    /// Percentage with one decimal, no `%` sign.
    pub hit_ratio: String,
    /// MiB with two decimals.
    pub memory_usage: String,
    pub total_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub total_requests: u64,
    /// Most recently used first.
    pub keys: Vec<KeyInfo>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyInfo {
    pub key: String,
    /// Body length in bytes.
    pub size: usize,
    /// Unix milliseconds.
    pub last_accessed: u64,
}

/// The subset of counters attached to every proxied response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheCounters {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
}

impl CacheManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: LruCache::new(capacity),
            hits: 0,
            misses: 0,
            total_requests: 0,
        }
    }

    pub fn get(&mut self, key: &str) -> Option<Bytes> {
        let value = self.cache.get(key);
        if value.is_some() {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        self.total_requests += 1;
        value
    }

    pub fn put(&mut self, key: String, value: Bytes) {
        self.cache.put(key, value);
    }

    /// Inspect one entry without affecting ordering or counters.
    pub fn peek(&self, key: &str) -> Option<&Entry> {
        self.cache.peek(key)
    }

    /// Invalidate a single key. `None` means the key was not cached.
    pub fn remove_key(&mut self, key: &str) -> Option<Bytes> {
        self.cache.remove(key)
    }

    /// Drop every entry and zero both the cache's and the manager's counters.
    pub fn clear(&mut self) {
        self.cache.clear();
        self.hits = 0;
        self.misses = 0;
        self.total_requests = 0;
    }

    pub fn counters(&self) -> CacheCounters {
        CacheCounters {
            size: self.cache.len(),
            hits: self.hits,
            misses: self.misses,
        }
    }

    /// Counters of the underlying LRU cache, including evictions.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests
    }

    pub fn hit_ratio(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.hits as f64 / self.total_requests as f64 * 100.0
        }
    }

    /// Walk the recency list front to back and build a report. Read-only.
    pub fn stats(&self) -> CacheSnapshot {
        let mut total_bytes: u64 = 0;
        let keys: Vec<KeyInfo> = self
            .cache
            .iter()
            .map(|entry| {
                total_bytes += entry.footprint() as u64;
                KeyInfo {
                    key: entry.key.clone(),
                    size: entry.value.len(),
                    last_accessed: entry.last_accessed_ms(),
                }
            })
            .collect();

        CacheSnapshot {
            size: self.cache.len(),
            limit: self.cache.capacity(),
            hit_ratio: format!("{:.1}", self.hit_ratio()),
            memory_usage: format!("{:.2}", total_bytes as f64 / BYTES_PER_MIB),
            total_bytes,
            hits: self.hits,
            misses: self.misses,
            total_requests: self.total_requests,
            keys,
        }
    }
}
