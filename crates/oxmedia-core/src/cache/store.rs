//! Byte-weighted LRU store.

use std::hash::Hash;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::trace;

struct Inner<K: Hash + Eq, V> {
    entries: LruCache<K, V>,
    total_weight: u64,
}

/// Least-recently-used map bounded by the summed weight of its values.
///
/// Weight comes from a weigher function (for decrypted payloads, the byte
/// length). After every insertion the total weight is at most `capacity`;
/// least-recently-accessed entries are evicted first to make room.
pub struct WeightedLru<K: Hash + Eq, V> {
    inner: Mutex<Inner<K, V>>,
    capacity: u64,
    weigher: fn(&V) -> u64,
}

impl<K: Hash + Eq + Clone, V: Clone> WeightedLru<K, V> {
    pub fn new(capacity: u64, weigher: fn(&V) -> u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                total_weight: 0,
            }),
            capacity,
            weigher,
        }
    }

    /// Look up `key`, marking it most recently used.
    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.lock().entries.get(key).cloned()
    }

    /// Look up `key` without touching recency.
    pub fn peek(&self, key: &K) -> Option<V> {
        self.inner.lock().entries.peek(key).cloned()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().entries.contains(key)
    }

    /// Insert `value`, evicting least-recently-used entries until it fits.
    ///
    /// A value heavier than the whole capacity is rejected and `false` is
    /// returned; the store is left unchanged in that case.
    pub fn insert(&self, key: K, value: V) -> bool {
        let weight = (self.weigher)(&value);
        if weight > self.capacity {
            trace!(weight, capacity = self.capacity, "Entry exceeds store capacity");
            return false;
        }

        let mut inner = self.inner.lock();
        if let Some(old) = inner.entries.pop(&key) {
            inner.total_weight -= (self.weigher)(&old);
        }

        while inner.total_weight + weight > self.capacity {
            let Some((_, evicted)) = inner.entries.pop_lru() else {
                break;
            };
            let evicted_weight = (self.weigher)(&evicted);
            inner.total_weight -= evicted_weight;
            trace!(evicted_weight, "Evicted least recently used entry");
        }

        inner.entries.push(key, value);
        inner.total_weight += weight;
        true
    }

    /// Remove `key`, returning its value.
    pub fn remove(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        let value = inner.entries.pop(key)?;
        inner.total_weight -= (self.weigher)(&value);
        Some(value)
    }

    /// Remove every entry heavier than `limit`. Returns how many were removed.
    pub fn remove_heavier_than(&self, limit: u64) -> usize {
        let mut inner = self.inner.lock();
        let heavy: Vec<K> = inner
            .entries
            .iter()
            .filter(|(_, v)| (self.weigher)(v) > limit)
            .map(|(k, _)| k.clone())
            .collect();

        for key in &heavy {
            if let Some(value) = inner.entries.pop(key) {
                inner.total_weight -= (self.weigher)(&value);
            }
        }
        heavy.len()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.total_weight = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of the weights of all stored values.
    pub fn weighted_size(&self) -> u64 {
        self.inner.lock().total_weight
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}
