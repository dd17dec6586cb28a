//! Aggregate configuration for every orchestration component.

use std::str::FromStr;
use std::time::Duration;

use crate::batcher::BatchConfig;
use crate::cache::CacheConfig;
use crate::limiter::RateLimitConfig;
use crate::memory::MemoryConfig;
use crate::optimizer::OptimizerConfig;
use crate::pool::PoolConfig;
use crate::scheduler::SchedulerConfig;

/// Configuration for the whole orchestration layer
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    pub cache: CacheConfig,
    pub memory: MemoryConfig,
    pub rate_limits: RateLimitConfig,
    pub scheduler: SchedulerConfig,
    pub batch: BatchConfig,
    pub pool: PoolConfig,
    pub optimizer: OptimizerConfig,
}

impl OrchestratorConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        Self {
            cache: CacheConfig::from_env(),
            memory: MemoryConfig::from_env(),
            rate_limits: RateLimitConfig::from_env(),
            scheduler: SchedulerConfig::from_env(),
            batch: BatchConfig::from_env(),
            pool: PoolConfig::from_env(),
            optimizer: OptimizerConfig::from_env(),
        }
    }

    /// Create config optimized for low latency (single interactive user)
    pub fn low_latency() -> Self {
        Self {
            scheduler: SchedulerConfig::low_latency(),
            batch: BatchConfig::low_latency(),
            ..Self::default()
        }
    }

    /// Create config optimized for high throughput (dashboards, bulk views)
    pub fn high_throughput() -> Self {
        Self {
            cache: CacheConfig::high_hit_rate(),
            scheduler: SchedulerConfig::high_throughput(),
            batch: BatchConfig::high_throughput(),
            ..Self::default()
        }
    }
}

/// Parse an environment variable, ignoring unset or malformed values
pub(crate) fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

/// Read a millisecond duration from the environment
pub(crate) fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}

/// Read a second duration from the environment
pub(crate) fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_secs)
}
