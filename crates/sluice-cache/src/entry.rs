use bytes::Bytes;
use std::time::{SystemTime, UNIX_EPOCH};

/// One cached upstream response body, keyed by its resolved target URL.
#[derive(Clone, Debug)]
pub struct Entry {
    pub key: String,
    pub value: Bytes,
    pub last_accessed: SystemTime,
}

impl Entry {
    pub fn new(key: String, value: Bytes) -> Self {
        Self {
            key,
            value,
            last_accessed: SystemTime::now(),
        }
    }

    #[inline]
    pub fn touch(&mut self) {
        self.last_accessed = SystemTime::now();
    }

    /// Bytes accounted to this entry in reports: UTF-8 length of key plus value.
    #[inline]
    pub fn footprint(&self) -> usize {
        self.key.len() + self.value.len()
    }

    /// Milliseconds since the Unix epoch of the last get/put of this key.
    pub fn last_accessed_ms(&self) -> u64 {
        self.last_accessed
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Counters kept by the LRU cache itself.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub current_size: usize,
    pub capacity: usize,
}
