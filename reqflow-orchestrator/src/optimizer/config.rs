//! Configuration for the query optimizer.

use std::time::Duration;

use crate::config::{env_millis, env_parse, env_secs};

/// Configuration for the query optimizer
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Time-to-live of rows cached by `get_by_id` and `prefetch`
    pub default_ttl: Duration,

    /// Time-to-live of cached list pages
    pub list_ttl: Duration,

    /// Queries at or above this latency are counted and logged as slow
    pub slow_query_threshold: Duration,

    /// Maximum cached rows and pages
    pub cache_capacity: usize,

    /// Interval between expiry sweeps
    pub sweep_interval: Duration,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300), // 5 minutes
            list_ttl: Duration::from_secs(60),
            slow_query_threshold: Duration::from_millis(1000),
            cache_capacity: 1000,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl OptimizerConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(ttl) = env_secs("REQFLOW_QUERY_TTL_SECS") {
            config.default_ttl = ttl;
        }
        if let Some(ttl) = env_secs("REQFLOW_LIST_TTL_SECS") {
            config.list_ttl = ttl;
        }
        if let Some(threshold) = env_millis("REQFLOW_SLOW_QUERY_MS") {
            config.slow_query_threshold = threshold;
        }
        if let Some(n) = env_parse("REQFLOW_QUERY_CACHE_CAPACITY") {
            config.cache_capacity = n;
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OptimizerConfig::default();
        assert_eq!(config.slow_query_threshold, Duration::from_secs(1));
        assert!(config.list_ttl < config.default_ttl);
    }
}
