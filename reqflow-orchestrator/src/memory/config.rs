//! Configuration for the memory bounder.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::config::{env_parse, env_secs};

/// How decoded images are held
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionStrategy {
    /// Non-owning references; an image disappears once its last owner drops it
    Weak,
    /// Bounded owning map with least-recently-used eviction
    Strong,
}

impl FromStr for RetentionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "weak" => Ok(Self::Weak),
            "strong" => Ok(Self::Strong),
            other => Err(format!("unknown retention strategy: {}", other)),
        }
    }
}

/// Configuration for the memory bounder
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Byte budget for cached data (estimated by serialized size)
    pub max_bytes: usize,

    /// Data entries older than this are dropped by the sweep
    pub max_age: Duration,

    /// Fraction of data entries kept by aggressive cleanup (0.0 - 1.0)
    pub keep_ratio: f64,

    /// Hard cap for the strong image map
    pub image_capacity: usize,

    /// Image retention strategy
    pub retention: RetentionStrategy,

    /// Interval between sweeps
    pub sweep_interval: Duration,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_bytes: 50 * 1024 * 1024, // 50 MB
            max_age: Duration::from_secs(600), // 10 minutes
            keep_ratio: 0.2,
            image_capacity: 100,
            retention: RetentionStrategy::Weak,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl MemoryConfig {
    /// Create config for constrained devices
    pub fn low_memory() -> Self {
        Self {
            max_bytes: 10 * 1024 * 1024,
            max_age: Duration::from_secs(300),
            image_capacity: 20,
            sweep_interval: Duration::from_secs(30),
            ..Self::default()
        }
    }

    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(n) = env_parse("REQFLOW_MEMORY_MAX_BYTES") {
            config.max_bytes = n;
        }
        if let Some(age) = env_secs("REQFLOW_MEMORY_MAX_AGE_SECS") {
            config.max_age = age;
        }
        if let Some(n) = env_parse("REQFLOW_IMAGE_CAPACITY") {
            config.image_capacity = n;
        }
        if let Some(strategy) = env_parse("REQFLOW_IMAGE_RETENTION") {
            config.retention = strategy;
        }

        config
    }
}
