//! Metrics module for the orchestration layer
//!
//! Provides Prometheus metrics for monitoring and observability.

pub mod prometheus;

// Re-export commonly used items
pub use prometheus::{
    encode_metrics, register_metrics, QueryTimer, ACTIVE_REQUESTS, CACHE_HITS_TOTAL,
    CACHE_MISSES_TOTAL, QUEUE_SIZE, REGISTRY,
};
