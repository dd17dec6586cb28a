//! Composition root wiring every component together.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use reqflow_core::{DataSource, RealtimeTransport};

use crate::batcher::{BatchStats, RequestBatcher};
use crate::cache::{ApiCache, CacheStats};
use crate::config::OrchestratorConfig;
use crate::limiter::{LimiterStats, RateLimiter};
use crate::memory::{MemoryOptimizer, MemoryStats};
use crate::optimizer::{DatabaseOptimizer, QueryMetrics};
use crate::pool::{ConnectionPool, PoolStats};
use crate::scheduler::{QueueManager, QueueStats};
use crate::ticker::Ticker;

/// Every orchestration component, built from one configuration
pub struct Orchestrator {
    /// Response cache for arbitrary JSON payloads
    pub cache: ApiCache<Value>,

    pub memory: Arc<MemoryOptimizer>,

    pub limiter: RateLimiter,

    pub scheduler: QueueManager,

    /// Realtime channel pool
    pub pool: Arc<ConnectionPool>,

    /// The batcher behind `optimizer`, for direct coalesced reads and counts
    pub batcher: RequestBatcher,

    pub optimizer: DatabaseOptimizer,

    source: Arc<dyn DataSource>,
    ticker: Mutex<Option<Ticker>>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        source: Arc<dyn DataSource>,
        transport: Arc<dyn RealtimeTransport>,
    ) -> Self {
        let optimizer = DatabaseOptimizer::new(
            Arc::clone(&source),
            config.optimizer.clone(),
            config.batch.clone(),
        );

        Self {
            cache: ApiCache::new(config.cache.clone()),
            memory: Arc::new(MemoryOptimizer::new(config.memory.clone())),
            limiter: RateLimiter::new(config.rate_limits.clone()),
            scheduler: QueueManager::new(config.scheduler.clone()),
            pool: Arc::new(ConnectionPool::new(transport, config.pool.clone())),
            batcher: optimizer.batcher().clone(),
            optimizer,
            source,
            ticker: Mutex::new(None),
            config,
        }
    }

    /// Start background ticks. Calling it again while running does nothing.
    pub fn start(&self) {
        let mut slot = self.ticker.lock();
        if slot.is_some() {
            return;
        }

        let mut ticker = Ticker::new();
        ticker.spawn(Arc::new(self.cache.clone()), self.config.cache.sweep_interval);
        ticker.spawn(self.memory.clone(), self.config.memory.sweep_interval);
        ticker.spawn(
            Arc::new(self.scheduler.clone()),
            self.config.scheduler.process_interval,
        );
        ticker.spawn(self.pool.clone(), self.config.pool.sweep_interval);
        ticker.spawn(
            Arc::new(self.optimizer.clone()),
            self.config.optimizer.sweep_interval,
        );

        info!(tasks = ticker.len(), "Orchestrator started");
        *slot = Some(ticker);
    }

    pub fn is_running(&self) -> bool {
        self.ticker.lock().is_some()
    }

    /// Stop ticks, reject everything still queued and close every channel
    pub async fn shutdown(&self) {
        if let Some(mut ticker) = self.ticker.lock().take() {
            ticker.shutdown();
        }

        let cancelled = self.scheduler.clear();
        let closed = self.pool.close_all().await;
        info!(cancelled, closed, "Orchestrator shut down");
    }

    /// Shed memory when the application goes to the background
    pub fn on_inactive(&self) -> usize {
        let removed = self.memory.aggressive_cleanup();
        info!(removed, "Released memory for inactive application");
        removed
    }

    /// The data source every read goes through
    pub fn source(&self) -> &Arc<dyn DataSource> {
        &self.source
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Statistics of every component
    pub async fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            cache: self.cache.stats(),
            memory: self.memory.stats(),
            limiter: self.limiter.stats(),
            scheduler: self.scheduler.stats(),
            pool: self.pool.stats().await,
            batcher: self.batcher.stats(),
            optimizer: self.optimizer.get_metrics(),
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if let Some(mut ticker) = self.ticker.get_mut().take() {
            ticker.shutdown();
        }
    }
}

/// Snapshot of every component's statistics
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStats {
    pub cache: CacheStats,
    pub memory: MemoryStats,
    pub limiter: LimiterStats,
    pub scheduler: QueueStats,
    pub pool: PoolStats,
    pub batcher: BatchStats,
    pub optimizer: QueryMetrics,
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqflow_core::{MemoryDataSource, MemoryTransport};

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(
            OrchestratorConfig::default(),
            Arc::new(MemoryDataSource::new()),
            MemoryTransport::new(),
        )
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let orchestrator = orchestrator();
        assert!(!orchestrator.is_running());

        orchestrator.start();
        orchestrator.start();
        assert!(orchestrator.is_running());

        orchestrator.shutdown().await;
        assert!(!orchestrator.is_running());
    }

    #[tokio::test]
    async fn test_on_inactive_keeps_recent_entries() {
        let orchestrator = orchestrator();
        for i in 0..10 {
            orchestrator.memory.cache_data(format!("k{}", i), Value::from(i));
        }

        assert_eq!(orchestrator.on_inactive(), 8);
        assert_eq!(orchestrator.memory.len(), 2);
    }

    #[tokio::test]
    async fn test_stats_snapshot_serializes() {
        let orchestrator = orchestrator();
        let stats = orchestrator.stats().await;

        let json = serde_json::to_value(&stats).unwrap();
        assert!(json.get("scheduler").is_some());
        assert!(json.get("pool").is_some());
    }
}
