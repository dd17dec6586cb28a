//! Metrics for the request batcher.

use std::sync::atomic::{AtomicU64, Ordering};

/// Metrics for monitoring batcher performance
#[derive(Debug, Default)]
pub struct BatcherMetrics {
    /// Total `query` calls received
    pub queries_received: AtomicU64,

    /// Batches dispatched as a single id lookup
    pub id_batches: AtomicU64,

    /// Batches dispatched call by call
    pub individual_batches: AtomicU64,

    /// Total calls in batches (for batch size averaging)
    pub total_batch_requests: AtomicU64,

    /// Backend calls avoided by merging id lookups
    pub calls_saved: AtomicU64,

    /// Batches that failed as a whole
    pub batch_failures: AtomicU64,

    /// Counts served from cache
    pub count_hits: AtomicU64,

    /// Counts fetched from the backend
    pub count_fetches: AtomicU64,

    /// Counts that joined an in-flight fetch
    pub count_deduplicated: AtomicU64,
}

impl BatcherMetrics {
    /// Create new metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self) {
        self.queries_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an id batch of `size` calls answered by one backend call
    pub fn record_id_batch(&self, size: usize) {
        self.id_batches.fetch_add(1, Ordering::Relaxed);
        self.total_batch_requests
            .fetch_add(size as u64, Ordering::Relaxed);
        self.calls_saved
            .fetch_add(size.saturating_sub(1) as u64, Ordering::Relaxed);
    }

    pub fn record_individual_batch(&self, size: usize) {
        self.individual_batches.fetch_add(1, Ordering::Relaxed);
        self.total_batch_requests
            .fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn record_batch_failure(&self) {
        self.batch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_count_hit(&self) {
        self.count_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_count_fetch(&self) {
        self.count_fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_count_deduplicated(&self) {
        self.count_deduplicated.fetch_add(1, Ordering::Relaxed);
    }

    /// Calculate average batch size
    pub fn avg_batch_size(&self) -> f64 {
        let batches = self.id_batches.load(Ordering::Relaxed)
            + self.individual_batches.load(Ordering::Relaxed);
        if batches == 0 {
            return 0.0;
        }
        let total_requests = self.total_batch_requests.load(Ordering::Relaxed);
        total_requests as f64 / batches as f64
    }

    /// Get a snapshot of all metrics
    pub fn snapshot(&self, pending: usize, cached_counts: usize) -> BatchStats {
        BatchStats {
            queries_received: self.queries_received.load(Ordering::Relaxed),
            id_batches: self.id_batches.load(Ordering::Relaxed),
            individual_batches: self.individual_batches.load(Ordering::Relaxed),
            calls_saved: self.calls_saved.load(Ordering::Relaxed),
            batch_failures: self.batch_failures.load(Ordering::Relaxed),
            avg_batch_size: self.avg_batch_size(),
            pending,
            count_hits: self.count_hits.load(Ordering::Relaxed),
            count_fetches: self.count_fetches.load(Ordering::Relaxed),
            count_deduplicated: self.count_deduplicated.load(Ordering::Relaxed),
            cached_counts,
        }
    }
}

/// Snapshot of batcher statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct BatchStats {
    pub queries_received: u64,
    pub id_batches: u64,
    pub individual_batches: u64,
    pub calls_saved: u64,
    pub batch_failures: u64,
    pub avg_batch_size: f64,
    /// Calls waiting in open batches
    pub pending: usize,
    pub count_hits: u64,
    pub count_fetches: u64,
    pub count_deduplicated: u64,
    pub cached_counts: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_metrics() {
        let metrics = BatcherMetrics::new();

        metrics.record_id_batch(4);
        metrics.record_individual_batch(6);

        assert_eq!(metrics.avg_batch_size(), 5.0);
        assert_eq!(metrics.calls_saved.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_snapshot() {
        let metrics = BatcherMetrics::new();
        metrics.record_received();
        metrics.record_count_hit();

        let stats = metrics.snapshot(2, 1);
        assert_eq!(stats.queries_received, 1);
        assert_eq!(stats.count_hits, 1);
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.avg_batch_size, 0.0);
    }
}
