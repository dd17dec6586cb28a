//! Configuration for the bounded API cache.

use std::time::Duration;

use crate::config::{env_parse, env_secs};

/// Configuration for the bounded API cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries
    pub capacity: usize,

    /// Time-to-live for entries set without an explicit TTL
    pub default_ttl: Duration,

    /// Fraction of entries removed when an insert hits capacity (0.0 - 1.0)
    pub evict_ratio: f64,

    /// Interval between proactive expiry sweeps
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            default_ttl: Duration::from_secs(300), // 5 minutes
            evict_ratio: 0.2,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    /// Create config optimized for low memory usage
    pub fn low_memory() -> Self {
        Self {
            capacity: 100,
            default_ttl: Duration::from_secs(120),
            evict_ratio: 0.3,
            sweep_interval: Duration::from_secs(30),
        }
    }

    /// Create config optimized for high cache hit rate
    pub fn high_hit_rate() -> Self {
        Self {
            capacity: 5000,
            default_ttl: Duration::from_secs(900), // 15 minutes
            evict_ratio: 0.1,
            sweep_interval: Duration::from_secs(60),
        }
    }

    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(n) = env_parse("REQFLOW_CACHE_SIZE") {
            config.capacity = n;
        }
        if let Some(ttl) = env_secs("REQFLOW_CACHE_TTL_SECS") {
            config.default_ttl = ttl;
        }
        if let Some(ratio) = env_parse::<f64>("REQFLOW_CACHE_EVICT_RATIO") {
            config.evict_ratio = ratio.clamp(0.0, 1.0);
        }

        config
    }
}
