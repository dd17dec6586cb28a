//! Configuration for the request batcher.

use std::time::Duration;

use crate::config::{env_millis, env_parse, env_secs};

/// Configuration for the request batcher
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// How long calls for the same table/columns accumulate before dispatch
    pub debounce: Duration,

    /// Dispatch as soon as this many calls are pending
    pub max_batch_size: usize,

    /// Time-to-live of cached counts
    pub count_ttl: Duration,

    /// Maximum cached counts
    pub count_capacity: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(10),
            max_batch_size: 50,
            count_ttl: Duration::from_secs(30),
            count_capacity: 500,
        }
    }
}

impl BatchConfig {
    /// Create config optimized for low latency (shorter window, smaller batches)
    pub fn low_latency() -> Self {
        Self {
            debounce: Duration::from_millis(2),
            max_batch_size: 20,
            ..Self::default()
        }
    }

    /// Create config optimized for high throughput (wider window, bigger batches)
    pub fn high_throughput() -> Self {
        Self {
            debounce: Duration::from_millis(25),
            max_batch_size: 100,
            count_ttl: Duration::from_secs(60),
            count_capacity: 2000,
        }
    }

    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(d) = env_millis("REQFLOW_BATCH_DEBOUNCE_MS") {
            config.debounce = d;
        }
        if let Some(n) = env_parse("REQFLOW_BATCH_MAX_SIZE") {
            config.max_batch_size = n;
        }
        if let Some(ttl) = env_secs("REQFLOW_COUNT_TTL_SECS") {
            config.count_ttl = ttl;
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BatchConfig::default();
        assert_eq!(config.debounce, Duration::from_millis(10));
        assert_eq!(config.max_batch_size, 50);
        assert_eq!(config.count_ttl, Duration::from_secs(30));
    }

    #[test]
    fn test_low_latency_config() {
        let config = BatchConfig::low_latency();
        assert!(config.debounce < BatchConfig::default().debounce);
    }

    #[test]
    fn test_high_throughput_config() {
        let config = BatchConfig::high_throughput();
        assert_eq!(config.max_batch_size, 100);
    }
}
