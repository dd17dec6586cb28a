//! Metrics for the query optimizer.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Query counters and latency accumulation
#[derive(Debug, Default)]
pub struct OptimizerMetrics {
    /// Every `get_by_id`/`get_list` call
    pub total_queries: AtomicU64,

    /// Lookups answered through the batcher
    pub batched_queries: AtomicU64,

    /// Lookups answered from cache
    pub cached_queries: AtomicU64,

    /// Queries at or above the slow threshold
    pub slow_queries: AtomicU64,

    /// Backend round trips timed
    pub timed_queries: AtomicU64,

    /// Sum of timed latencies in microseconds
    pub total_latency_us: AtomicU64,
}

impl OptimizerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_query(&self) {
        self.total_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cached(&self) {
        self.cached_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batched(&self) {
        self.batched_queries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a backend round trip; returns true when it counts as slow
    pub fn record_latency(&self, latency: Duration, slow_threshold: Duration) -> bool {
        self.timed_queries.fetch_add(1, Ordering::Relaxed);
        self.total_latency_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);

        let slow = latency >= slow_threshold;
        if slow {
            self.slow_queries.fetch_add(1, Ordering::Relaxed);
        }
        slow
    }

    /// Running average latency of backend round trips
    pub fn avg_latency_ms(&self) -> f64 {
        let timed = self.timed_queries.load(Ordering::Relaxed);
        if timed == 0 {
            return 0.0;
        }
        self.total_latency_us.load(Ordering::Relaxed) as f64 / timed as f64 / 1000.0
    }

    pub fn snapshot(&self, cached_entries: usize) -> QueryMetrics {
        QueryMetrics {
            total_queries: self.total_queries.load(Ordering::Relaxed),
            batched_queries: self.batched_queries.load(Ordering::Relaxed),
            cached_queries: self.cached_queries.load(Ordering::Relaxed),
            slow_queries: self.slow_queries.load(Ordering::Relaxed),
            avg_latency_ms: self.avg_latency_ms(),
            cached_entries,
        }
    }
}

/// Snapshot returned by `DatabaseOptimizer::get_metrics`
#[derive(Debug, Clone, Serialize)]
pub struct QueryMetrics {
    pub total_queries: u64,
    pub batched_queries: u64,
    pub cached_queries: u64,
    pub slow_queries: u64,
    pub avg_latency_ms: f64,
    pub cached_entries: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_average() {
        let metrics = OptimizerMetrics::new();
        let threshold = Duration::from_millis(1000);

        assert!(!metrics.record_latency(Duration::from_millis(100), threshold));
        assert!(metrics.record_latency(Duration::from_millis(1500), threshold));

        assert_eq!(metrics.avg_latency_ms(), 800.0);
        assert_eq!(metrics.slow_queries.load(Ordering::Relaxed), 1);
    }
}
