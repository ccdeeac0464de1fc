//! Cache efficiency and contention counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Process-wide counters for the decrypt cache and sidecar store.
///
/// Thread-safe counters using atomic operations for lock-free updates.
/// Counters only ever increase; there is deliberately no reset.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    /// Number of times the external decryptor was invoked
    decrypt_invocations: AtomicU64,

    /// Number of requests that attached to an in-flight decrypt
    coalesced_waiters: AtomicU64,

    /// Number of requests served from the cache store
    cache_hits: AtomicU64,

    /// Number of requests that started a decrypt episode
    cache_misses: AtomicU64,

    /// Number of sidecar record lookups
    sidecar_reads: AtomicU64,

    /// Number of sidecar records written
    sidecar_writes: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_decrypt_invocation(&self) {
        self.decrypt_invocations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_coalesced_waiter(&self) {
        self.coalesced_waiters.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sidecar_read(&self) {
        self.sidecar_reads.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sidecar_write(&self) {
        self.sidecar_writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current snapshot of metrics.
    ///
    /// The six loads are individually atomic but not taken together, which
    /// is fine for observability.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            decrypt_invocations: self.decrypt_invocations.load(Ordering::Relaxed),
            coalesced_waiters: self.coalesced_waiters.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            sidecar_reads: self.sidecar_reads.load(Ordering::Relaxed),
            sidecar_writes: self.sidecar_writes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of the media core counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub decrypt_invocations: u64,
    pub coalesced_waiters: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub sidecar_reads: u64,
    pub sidecar_writes: u64,
}

impl MetricsSnapshot {
    /// Total `get` requests seen by the cache.
    pub fn total_requests(&self) -> u64 {
        self.cache_hits + self.cache_misses + self.coalesced_waiters
    }

    /// Fraction of requests served straight from the store (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }

    /// Fraction of non-hit requests that were coalesced onto another
    /// caller's decrypt (0.0 to 1.0).
    pub fn dedup_ratio(&self) -> f64 {
        let total = self.cache_misses + self.coalesced_waiters;
        if total == 0 {
            0.0
        } else {
            self.coalesced_waiters as f64 / total as f64
        }
    }

    /// True when no counter is lower than in `earlier`.
    pub fn dominates(&self, earlier: &MetricsSnapshot) -> bool {
        self.decrypt_invocations >= earlier.decrypt_invocations
            && self.coalesced_waiters >= earlier.coalesced_waiters
            && self.cache_hits >= earlier.cache_hits
            && self.cache_misses >= earlier.cache_misses
            && self.sidecar_reads >= earlier.sidecar_reads
            && self.sidecar_writes >= earlier.sidecar_writes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_counters_are_independent() {
        let metrics = MetricsCollector::new();
        metrics.record_cache_hit();
        metrics.record_cache_hit();
        metrics.record_cache_miss();
        metrics.record_decrypt_invocation();
        metrics.record_coalesced_waiter();
        metrics.record_sidecar_read();

        let snap = metrics.snapshot();
        assert_eq!(snap.cache_hits, 2);
        assert_eq!(snap.cache_misses, 1);
        assert_eq!(snap.decrypt_invocations, 1);
        assert_eq!(snap.coalesced_waiters, 1);
        assert_eq!(snap.sidecar_reads, 1);
        assert_eq!(snap.sidecar_writes, 0);
    }

    #[test]
    fn test_ratios() {
        let snap = MetricsSnapshot {
            cache_hits: 3,
            cache_misses: 1,
            coalesced_waiters: 2,
            ..Default::default()
        };
        assert_eq!(snap.total_requests(), 6);
        assert!((snap.hit_rate() - 0.5).abs() < 1e-9);
        assert!((snap.dedup_ratio() - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(MetricsSnapshot::default().hit_rate(), 0.0);
    }

    #[test]
    fn test_snapshots_monotonic_under_concurrency() {
        let metrics = Arc::new(MetricsCollector::new());
        let writers: Vec<_> = (0..4)
            .map(|_| {
                let metrics = Arc::clone(&metrics);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        metrics.record_cache_hit();
                        metrics.record_sidecar_write();
                    }
                })
            })
            .collect();

        let mut previous = metrics.snapshot();
        for _ in 0..200 {
            let current = metrics.snapshot();
            assert!(current.dominates(&previous));
            previous = current;
        }

        for writer in writers {
            writer.join().unwrap();
        }
        assert_eq!(metrics.snapshot().cache_hits, 4000);
    }
}
