//! Metrics for the priority scheduler.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::metrics::prometheus;

/// Metrics for monitoring scheduler performance
#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    /// Total requests accepted into the queue
    pub requests_enqueued: AtomicU64,

    /// Requests that resolved successfully
    pub requests_processed: AtomicU64,

    /// Requests rejected after exhausting retries
    pub requests_failed: AtomicU64,

    /// Queued requests displaced by higher priority work
    pub requests_dropped: AtomicU64,

    /// Enqueues refused because the queue was full
    pub requests_rejected: AtomicU64,

    /// Retry attempts scheduled
    pub retries: AtomicU64,

    /// Queued requests discarded because their caller stopped waiting
    pub requests_cancelled: AtomicU64,

    /// Actions run through the immediate path
    pub immediate: AtomicU64,

    /// Requests that started executing (first attempt only)
    pub requests_started: AtomicU64,

    /// Total queue wait time in milliseconds (for averaging)
    pub total_queue_wait_ms: AtomicU64,
}

impl SchedulerMetrics {
    /// Create new metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_enqueued(&self) {
        self.requests_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the first execution start of a request
    pub fn record_started(&self, wait_time: Duration) {
        self.requests_started.fetch_add(1, Ordering::Relaxed);
        self.total_queue_wait_ms
            .fetch_add(wait_time.as_millis() as u64, Ordering::Relaxed);
        prometheus::record_queue_wait(wait_time.as_secs_f64());
    }

    pub fn record_processed(&self) {
        self.requests_processed.fetch_add(1, Ordering::Relaxed);
        prometheus::record_scheduled("processed");
    }

    pub fn record_failed(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
        prometheus::record_scheduled("failed");
    }

    pub fn record_dropped(&self) {
        self.requests_dropped.fetch_add(1, Ordering::Relaxed);
        prometheus::record_scheduled("dropped");
    }

    pub fn record_rejected(&self) {
        self.requests_rejected.fetch_add(1, Ordering::Relaxed);
        prometheus::record_scheduled("rejected");
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.requests_cancelled.fetch_add(1, Ordering::Relaxed);
        prometheus::record_scheduled("cancelled");
    }

    pub fn record_immediate(&self) {
        self.immediate.fetch_add(1, Ordering::Relaxed);
    }

    /// Running average of time between enqueue and first execution start
    pub fn avg_queue_wait_ms(&self) -> f64 {
        let started = self.requests_started.load(Ordering::Relaxed);
        if started == 0 {
            return 0.0;
        }
        let total_wait = self.total_queue_wait_ms.load(Ordering::Relaxed);
        total_wait as f64 / started as f64
    }
}
