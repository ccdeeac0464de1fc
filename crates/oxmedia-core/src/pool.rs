//! Size-bucketed pool of reusable byte buffers.
//!
//! Decrypting a vault file needs one ciphertext scratch buffer per block.
//! Borrowing those from a pool keeps repeated decrypts from hammering the
//! allocator with identically sized requests.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::config::PoolConfig;

/// One size class and its idle buffers.
struct Bucket {
    size: usize,
    buffers: Mutex<Vec<Vec<u8>>>,
}

#[derive(Debug, Default)]
struct PoolCounters {
    borrows: AtomicU64,
    reuses: AtomicU64,
    fresh_allocations: AtomicU64,
    recycled: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Calls to [`BufferPool::borrow`].
    pub borrows: u64,
    /// Borrows served from a bucket.
    pub reuses: u64,
    /// Borrows that had to allocate.
    pub fresh_allocations: u64,
    /// Buffers accepted back by [`BufferPool::recycle`].
    pub recycled: u64,
    /// Buffers offered back but discarded (size mismatch or full bucket).
    pub dropped: u64,
}

impl PoolStats {
    /// Fraction of borrows that reused a pooled buffer.
    pub fn reuse_rate(&self) -> f64 {
        if self.borrows == 0 {
            0.0
        } else {
            self.reuses as f64 / self.borrows as f64
        }
    }
}

/// Pool of byte buffers organised into fixed size classes.
///
/// Every buffer handed out by [`borrow`](Self::borrow) has a length equal to
/// its size class (or the exact request, above the largest class). Reused
/// buffers are not zeroed; callers overwrite what they read.
pub struct BufferPool {
    /// Sorted ascending by size, no duplicates.
    buckets: Vec<Bucket>,
    max_per_bucket: usize,
    counters: PoolCounters,
}

impl BufferPool {
    /// Create a pool with the default 8/16/32/64 KiB classes.
    pub fn new() -> Self {
        Self::with_config(&PoolConfig::default())
    }

    pub fn with_config(config: &PoolConfig) -> Self {
        let mut sizes: Vec<usize> = config
            .size_classes
            .iter()
            .copied()
            .filter(|&s| s > 0)
            .collect();
        sizes.sort_unstable();
        sizes.dedup();

        let buckets = sizes
            .into_iter()
            .map(|size| Bucket {
                size,
                buffers: Mutex::new(Vec::with_capacity(config.max_per_bucket)),
            })
            .collect();

        Self {
            buckets,
            max_per_bucket: config.max_per_bucket,
            counters: PoolCounters::default(),
        }
    }

    /// Borrow a buffer of at least `min_size` bytes.
    ///
    /// Picks the smallest class that fits. Requests above every class get a
    /// one-off buffer of exactly `min_size` bytes.
    pub fn borrow(&self, min_size: usize) -> Vec<u8> {
        self.counters.borrows.fetch_add(1, Ordering::Relaxed);

        let Some(bucket) = self.buckets.iter().find(|b| b.size >= min_size) else {
            trace!(min_size, "Request exceeds all size classes, allocating exact");
            self.counters.fresh_allocations.fetch_add(1, Ordering::Relaxed);
            return vec![0u8; min_size];
        };

        if let Some(buffer) = bucket.buffers.lock().pop() {
            self.counters.reuses.fetch_add(1, Ordering::Relaxed);
            return buffer;
        }

        self.counters.fresh_allocations.fetch_add(1, Ordering::Relaxed);
        vec![0u8; bucket.size]
    }

    /// Return a buffer to the pool.
    ///
    /// Accepted only when its length equals a size class and that bucket is
    /// below its limit. Anything else is dropped.
    pub fn recycle(&self, buffer: Vec<u8>) {
        let Some(bucket) = self.buckets.iter().find(|b| b.size == buffer.len()) else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let mut buffers = bucket.buffers.lock();
        if buffers.len() < self.max_per_bucket {
            buffers.push(buffer);
            self.counters.recycled.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Number of idle buffers held for `size_class`, or `None` if it is not
    /// a configured class.
    pub fn pooled_count(&self, size_class: usize) -> Option<usize> {
        self.buckets
            .iter()
            .find(|b| b.size == size_class)
            .map(|b| b.buffers.lock().len())
    }

    /// Configured size classes, ascending.
    pub fn size_classes(&self) -> Vec<usize> {
        self.buckets.iter().map(|b| b.size).collect()
    }

    /// Total bytes currently held idle across all buckets.
    pub fn pooled_bytes(&self) -> usize {
        self.buckets
            .iter()
            .map(|b| b.size * b.buffers.lock().len())
            .sum()
    }

    /// Drop every idle buffer. Returns the number of bytes released.
    pub fn clear(&self) -> usize {
        let mut freed = 0;
        for bucket in &self.buckets {
            let mut buffers = bucket.buffers.lock();
            freed += bucket.size * buffers.len();
            buffers.clear();
        }
        freed
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            borrows: self.counters.borrows.load(Ordering::Relaxed),
            reuses: self.counters.reuses.load(Ordering::Relaxed),
            fresh_allocations: self.counters.fresh_allocations.load(Ordering::Relaxed),
            recycled: self.counters.recycled.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("size_classes", &self.size_classes())
            .field("max_per_bucket", &self.max_per_bucket)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
