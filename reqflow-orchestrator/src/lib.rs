//! Reqflow Orchestrator Library
//!
//! Client-side orchestration of requests to a remote data service.
//!
//! This library sits between application code and a [`DataSource`] /
//! [`RealtimeTransport`] and provides:
//!
//! - [`ApiCache`]: bounded TTL cache with in-flight deduplication
//! - [`MemoryOptimizer`]: byte-budgeted data cache plus image retention
//! - [`RateLimiter`]: per-category fixed-window admission with FIFO queuing
//! - [`QueueManager`]: four-tier priority scheduler with retries and backpressure
//! - [`ConnectionPool`]: reference-counted realtime channel sharing
//! - [`RequestBatcher`]: debounced coalescing of id lookups and cached counts
//! - [`DatabaseOptimizer`]: cached, batched read API with query metrics
//!
//! [`Orchestrator`] builds all of them from one [`OrchestratorConfig`] and
//! drives their background maintenance through a [`Ticker`].
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//! use reqflow_core::{MemoryDataSource, MemoryTransport};
//! use reqflow_orchestrator::{Orchestrator, OrchestratorConfig, Priority};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let orchestrator = Orchestrator::new(
//!         OrchestratorConfig::from_env(),
//!         Arc::new(MemoryDataSource::new()),
//!         MemoryTransport::new(),
//!     );
//!     orchestrator.start();
//!
//!     let ticket = orchestrator.scheduler.enqueue(|| async { Ok(42) }, Priority::High, None);
//!     assert_eq!(ticket.await?, 42);
//!
//!     orchestrator.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod batcher;
pub mod cache;
pub mod config;
mod guard;
pub mod limiter;
pub mod memory;
pub mod metrics;
pub mod optimizer;
pub mod pool;
pub mod rest;
pub mod scheduler;
pub mod state;
pub mod ticker;

pub use batcher::{BatchConfig, BatchStats, RequestBatcher};
pub use cache::{ApiCache, CacheConfig, CacheStats};
pub use config::OrchestratorConfig;
pub use limiter::{RateLimitConfig, RateLimiter};
pub use memory::{CachedImage, MemoryConfig, MemoryOptimizer, RetentionStrategy};
pub use optimizer::{DatabaseOptimizer, ListOptions, OptimizerConfig, QueryMetrics};
pub use pool::{ConnectionPool, PoolConfig};
pub use rest::{RestConfig, RestDataSource};
pub use scheduler::{Priority, QueueManager, QueueStats, SchedulerConfig, Ticket};
pub use state::{Orchestrator, OrchestratorStats};
pub use ticker::{Tick, Ticker};

pub use reqflow_core::{DataSource, RealtimeTransport, ReqflowError, Result};

use tracing::warn;

/// Initialize Prometheus metrics registry.
/// Should be called once before metrics are scraped.
pub fn init_metrics() {
    if let Err(e) = metrics::register_metrics() {
        warn!("Failed to register Prometheus metrics: {}", e);
    }
}
