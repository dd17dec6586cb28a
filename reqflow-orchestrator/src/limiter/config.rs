//! Configuration for the admission limiter.

use std::collections::HashMap;
use std::time::Duration;

use crate::config::env_parse;

/// Category whose limit applies to categories with no limit of their own
pub const DEFAULT_CATEGORY: &str = "api";

/// Maximum admissions per fixed window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CategoryLimit {
    pub max_requests: u32,
    pub window: Duration,
}

impl CategoryLimit {
    pub fn per_minute(max_requests: u32) -> Self {
        Self {
            max_requests,
            window: Duration::from_secs(60),
        }
    }
}

impl Default for CategoryLimit {
    fn default() -> Self {
        Self::per_minute(100)
    }
}

/// Configuration for the admission limiter
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Limits keyed by category name
    pub limits: HashMap<String, CategoryLimit>,

    /// Maximum actions waiting per category
    pub max_queue_per_category: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let limits = [
            ("api", CategoryLimit::per_minute(100)),
            ("ai", CategoryLimit::per_minute(10)),
            ("upload", CategoryLimit::per_minute(5)),
            ("realtime", CategoryLimit::per_minute(200)),
        ]
        .into_iter()
        .map(|(name, limit)| (name.to_string(), limit))
        .collect();

        Self {
            limits,
            max_queue_per_category: 1000,
        }
    }
}

impl RateLimitConfig {
    /// Limit for a category, falling back to the `api` limit
    pub fn limit_for(&self, category: &str) -> CategoryLimit {
        self.limits
            .get(category)
            .or_else(|| self.limits.get(DEFAULT_CATEGORY))
            .copied()
            .unwrap_or_default()
    }

    /// Create config from environment variables.
    ///
    /// `REQFLOW_RATE_<CATEGORY>_MAX` overrides the per-window maximum of a
    /// known category, `REQFLOW_RATE_QUEUE_MAX` the per-category queue bound.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        for (name, limit) in config.limits.iter_mut() {
            let key = format!("REQFLOW_RATE_{}_MAX", name.to_ascii_uppercase());
            if let Some(n) = env_parse(&key) {
                limit.max_requests = n;
            }
        }
        if let Some(n) = env_parse("REQFLOW_RATE_QUEUE_MAX") {
            config.max_queue_per_category = n;
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let config = RateLimitConfig::default();
        assert_eq!(config.limit_for("api").max_requests, 100);
        assert_eq!(config.limit_for("ai").max_requests, 10);
        assert_eq!(config.limit_for("upload").max_requests, 5);
        assert_eq!(config.limit_for("realtime").max_requests, 200);
        assert_eq!(config.limit_for("ai").window, Duration::from_secs(60));
    }

    #[test]
    fn test_unknown_category_uses_api_limit() {
        let config = RateLimitConfig::default();
        assert_eq!(config.limit_for("search"), config.limit_for("api"));
    }
}
