use crate::entry::{CacheStats, Entry};
use crate::recency::{Iter, RecencyList};
use ahash::AHashMap;
use bytes::Bytes;

/// Fixed-capacity LRU cache of response bodies keyed by target URL.
///
/// A key index maps each key to its handle in the [`RecencyList`]. Every hit
/// and every put moves the entry to the front; evictions take the tail.
///
/// `get` mutates ordering, so the cache needs exclusive access for reads as
/// well as writes.
pub struct LruCache {
    list: RecencyList,
    index: AHashMap<String, u32>,
    capacity: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl LruCache {
    /// A capacity of zero is allowed: every put is dropped and every get misses.
    pub fn new(capacity: usize) -> Self {
        Self {
            list: RecencyList::with_capacity(capacity),
            index: AHashMap::with_capacity(capacity),
            capacity,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    pub fn get(&mut self, key: &str) -> Option<Bytes> {
        let Some(&handle) = self.index.get(key) else {
            self.misses += 1;
            return None;
        };
        self.list.move_to_front(handle);
        let entry = self.list.get_mut(handle)?;
        entry.touch();
        self.hits += 1;
        Some(entry.value.clone())
    }

    /// Look at an entry without promoting it or counting a hit/miss.
    pub fn peek(&self, key: &str) -> Option<&Entry> {
        let &handle = self.index.get(key)?;
        self.list.get(handle)
    }

    pub fn put(&mut self, key: String, value: Bytes) {
        if let Some(&handle) = self.index.get(&key) {
            // Update in place: never grows the cache, never evicts.
            if let Some(entry) = self.list.get_mut(handle) {
                entry.value = value;
                entry.touch();
            }
            self.list.move_to_front(handle);
            return;
        }

        if self.capacity == 0 {
            return;
        }

        // Make room before inserting so size never exceeds capacity.
        if self.list.len() >= self.capacity {
            if let Some(evicted) = self.list.remove_tail() {
                self.index.remove(&evicted.key);
                self.evictions += 1;
            }
        }

        let handle = self.list.push_front(Entry::new(key.clone(), value));
        self.index.insert(key, handle);
    }

    /// Drop a single key. Returns the removed body, or `None` if absent.
    pub fn remove(&mut self, key: &str) -> Option<Bytes> {
        let handle = self.index.remove(key)?;
        self.list.remove(handle).map(|e| e.value)
    }

    /// Empty the cache and reset its own counters.
    pub fn clear(&mut self) {
        self.index.clear();
        self.list.clear();
        self.hits = 0;
        self.misses = 0;
        self.evictions = 0;
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    /// Entries from most to least recently used. Does not affect ordering.
    pub fn iter(&self) -> Iter<'_> {
        self.list.iter()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            current_size: self.list.len(),
            capacity: self.capacity,
        }
    }
}
