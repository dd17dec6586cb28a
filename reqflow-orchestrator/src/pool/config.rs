//! Configuration for the realtime connection pool.

use std::time::Duration;

use crate::config::{env_parse, env_secs};

/// Configuration for the realtime connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum open channels
    pub max_channels: usize,

    /// How long an unreferenced channel stays reusable
    pub idle_ttl: Duration,

    /// Interval between idle sweeps
    pub sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_channels: 50,
            idle_ttl: Duration::from_secs(300), // 5 minutes
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl PoolConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(n) = env_parse("REQFLOW_POOL_MAX_CHANNELS") {
            config.max_channels = n;
        }
        if let Some(ttl) = env_secs("REQFLOW_POOL_IDLE_TTL_SECS") {
            config.idle_ttl = ttl;
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PoolConfig::default();
        assert_eq!(config.max_channels, 50);
        assert_eq!(config.idle_ttl, Duration::from_secs(300));
    }
}
