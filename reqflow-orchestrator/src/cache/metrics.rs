//! Metrics for the bounded API cache.

use std::sync::atomic::{AtomicU64, Ordering};

/// Metrics for monitoring cache performance
#[derive(Debug, Default)]
pub struct CacheMetrics {
    /// Reads served from a live entry
    pub hits: AtomicU64,
    /// Reads that found nothing (or an expired entry)
    pub misses: AtomicU64,
    /// Total sets
    pub sets: AtomicU64,
    /// Entries removed by capacity eviction
    pub evictions: AtomicU64,
    /// Entries removed because their TTL elapsed
    pub expirations: AtomicU64,
    /// Fetches started by `with_cache`
    pub fetches: AtomicU64,
    /// Callers that joined an in-flight fetch instead of starting one
    pub deduplicated: AtomicU64,
    /// Fetches that failed
    pub fetch_failures: AtomicU64,
}

impl CacheMetrics {
    /// Create new metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: usize) {
        self.evictions.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_expirations(&self, count: usize) {
        self.expirations.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_fetch(&self) {
        self.fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deduplicated(&self) {
        self.deduplicated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch_failure(&self) {
        self.fetch_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of all metrics
    pub fn snapshot(&self, entries: usize) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStats {
            entries,
            hits,
            misses,
            sets: self.sets.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            fetches: self.fetches.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }

    /// Reset all metrics
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.sets.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.expirations.store(0, Ordering::Relaxed);
        self.fetches.store(0, Ordering::Relaxed);
        self.deduplicated.store(0, Ordering::Relaxed);
        self.fetch_failures.store(0, Ordering::Relaxed);
    }
}

/// Snapshot of cache statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub fetches: u64,
    pub deduplicated: u64,
    pub fetch_failures: u64,
    pub hit_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        let metrics = CacheMetrics::new();
        metrics.record_hit();
        metrics.record_hit();
        metrics.record_hit();
        metrics.record_miss();

        let stats = metrics.snapshot(4);
        assert_eq!(stats.entries, 4);
        assert!((stats.hit_rate - 0.75).abs() < 0.001);
    }

    #[test]
    fn test_empty_and_reset() {
        let metrics = CacheMetrics::new();
        assert_eq!(metrics.snapshot(0).hit_rate, 0.0);

        metrics.record_evictions(5);
        metrics.record_deduplicated();
        metrics.reset();

        let stats = metrics.snapshot(0);
        assert_eq!(stats.evictions, 0);
        assert_eq!(stats.deduplicated, 0);
    }
}
