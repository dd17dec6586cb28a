//! Configuration for the priority scheduler.

use std::time::Duration;

use super::queue::Priority;
use crate::config::{env_millis, env_parse};

/// Relative weight of each priority tier. Higher weights are served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityWeights {
    pub critical: u32,
    pub high: u32,
    pub normal: u32,
    pub low: u32,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            critical: 1000,
            high: 100,
            normal: 10,
            low: 1,
        }
    }
}

impl PriorityWeights {
    pub fn weight(&self, priority: Priority) -> u32 {
        match priority {
            Priority::Critical => self.critical,
            Priority::High => self.high,
            Priority::Normal => self.normal,
            Priority::Low => self.low,
        }
    }

    /// Tiers in service order, heaviest first. Ties keep declaration order.
    pub fn order(&self) -> [Priority; 4] {
        let mut order = Priority::ALL;
        order.sort_by(|a, b| self.weight(*b).cmp(&self.weight(*a)));
        order
    }
}

/// Configuration for the priority scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum number of actions executing at once
    pub max_concurrent: usize,

    /// Queued items at which backpressure kicks in
    pub max_queue_size: usize,

    /// Interval between queue processing ticks
    pub process_interval: Duration,

    /// Base retry backoff, multiplied by the retry number
    pub retry_delay: Duration,

    /// Retries granted to enqueues that don't specify their own
    pub default_max_retries: u32,

    /// Tier weights
    pub priority_weights: PriorityWeights,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 6,
            max_queue_size: 100,
            process_interval: Duration::from_millis(50),
            retry_delay: Duration::from_millis(1000),
            default_max_retries: 3,
            priority_weights: PriorityWeights::default(),
        }
    }
}

impl SchedulerConfig {
    /// Create config optimized for low latency (single interactive user)
    pub fn low_latency() -> Self {
        Self {
            max_concurrent: 4,
            max_queue_size: 50,
            process_interval: Duration::from_millis(10),
            retry_delay: Duration::from_millis(250),
            default_max_retries: 2,
            ..Self::default()
        }
    }

    /// Create config optimized for high throughput (many concurrent views)
    pub fn high_throughput() -> Self {
        Self {
            max_concurrent: 12,
            max_queue_size: 500,
            process_interval: Duration::from_millis(100),
            ..Self::default()
        }
    }

    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(n) = env_parse("REQFLOW_MAX_CONCURRENT") {
            config.max_concurrent = n;
        }
        if let Some(n) = env_parse("REQFLOW_MAX_QUEUE") {
            config.max_queue_size = n;
        }
        if let Some(d) = env_millis("REQFLOW_PROCESS_INTERVAL_MS") {
            config.process_interval = d;
        }
        if let Some(d) = env_millis("REQFLOW_RETRY_DELAY_MS") {
            config.retry_delay = d;
        }
        if let Some(n) = env_parse("REQFLOW_MAX_RETRIES") {
            config.default_max_retries = n;
        }

        config
    }
}
