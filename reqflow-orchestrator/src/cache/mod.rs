//! Bounded API response cache with in-flight deduplication.
//!
//! # Architecture
//!
//! ```text
//! with_cache(key, fetcher)
//!        │
//!        ▼
//! ┌──────────────┐
//! │ BoundedStore │ ─── live entry? return it
//! │ (TTL + evict)│
//! └──────┬───────┘
//!        │ Miss
//!        ▼
//! ┌──────────────┐
//! │  In-flight   │ ─── same key already fetching? await the shared result
//! │   markers    │
//! └──────┬───────┘
//!        │ None
//!        ▼
//!   spawn fetcher ─── on settle: cache success, drop marker
//! ```
//!
//! # Features
//!
//! - **Capacity bound**: bulk eviction of the least-accessed entries
//! - **Lazy + swept expiry**: reads treat expired entries as absent, a
//!   periodic sweep removes the rest
//! - **Deduplication**: concurrent fetches for one key hit the backend once

mod config;
mod metrics;
mod store;

pub use config::CacheConfig;
pub use metrics::{CacheMetrics, CacheStats};
pub use store::BoundedStore;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reqflow_core::{ReqflowError, Result};

use crate::guard::catch_panic;
use crate::metrics::prometheus;
use crate::ticker::Tick;

type InFlight<V> = Shared<BoxFuture<'static, Result<V>>>;

struct CacheState<V> {
    store: BoundedStore<V>,
    in_flight: HashMap<String, InFlight<V>>,
}

struct CacheInner<V> {
    state: Mutex<CacheState<V>>,
    metrics: CacheMetrics,
    config: CacheConfig,
}

impl<V: Clone> CacheInner<V> {
    /// Record the outcome of a fetch and release its in-flight marker
    fn settle(&self, key: &str, result: &Result<V>, ttl: Duration) {
        let mut state = self.state.lock();
        state.in_flight.remove(key);
        match result {
            Ok(value) => {
                let evicted = state.store.set(key.to_string(), value.clone(), ttl);
                self.metrics.record_set();
                self.record_evictions(evicted);
            }
            Err(e) => {
                self.metrics.record_fetch_failure();
                tracing::debug!(key = %key, error = %e, "Fetch failed, nothing cached");
            }
        }
    }

    fn record_evictions(&self, evicted: usize) {
        if evicted > 0 {
            self.metrics.record_evictions(evicted);
            prometheus::record_cache_evictions("api", evicted as u64);
        }
    }
}

/// TTL + capacity bounded cache shared by cloning
pub struct ApiCache<V> {
    inner: Arc<CacheInner<V>>,
}

impl<V> Clone for ApiCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> ApiCache<V> {
    /// Create a new cache with the given configuration
    pub fn new(config: CacheConfig) -> Self {
        let store = BoundedStore::new(config.capacity, config.evict_ratio);
        Self {
            inner: Arc::new(CacheInner {
                state: Mutex::new(CacheState {
                    store,
                    in_flight: HashMap::new(),
                }),
                metrics: CacheMetrics::new(),
                config,
            }),
        }
    }

    /// Store a value, using the default TTL when none is given
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.inner.config.default_ttl);
        let evicted = self.inner.state.lock().store.set(key.into(), value, ttl);
        self.inner.metrics.record_set();
        self.inner.record_evictions(evicted);
    }

    /// Read a live value
    pub fn get(&self, key: &str) -> Option<V> {
        let value = self.inner.state.lock().store.get(key);
        if value.is_some() {
            self.inner.metrics.record_hit();
            prometheus::record_cache_hit("api");
        } else {
            self.inner.metrics.record_miss();
            prometheus::record_cache_miss("api");
        }
        value
    }

    pub fn has(&self, key: &str) -> bool {
        self.inner.state.lock().store.has(key)
    }

    pub fn delete(&self, key: &str) -> bool {
        self.inner.state.lock().store.delete(key)
    }

    /// Remove every entry. In-flight fetches are left to settle.
    pub fn clear(&self) {
        self.inner.state.lock().store.clear();
    }

    /// Remove every entry whose key matches the regular expression
    pub fn clear_by_pattern(&self, pattern: &str) -> Result<usize> {
        let regex = Regex::new(pattern)
            .map_err(|e| ReqflowError::invalid(format!("bad cache key pattern: {}", e)))?;
        let removed = self.inner.state.lock().store.clear_by_pattern(&regex);
        tracing::debug!(pattern = %pattern, removed, "Cleared cache entries by pattern");
        Ok(removed)
    }

    /// Return the cached value, join an in-flight fetch, or start one.
    ///
    /// The fetch runs on its own task, so it completes and populates the
    /// cache even if every caller stops waiting. A failure is handed to all
    /// callers that joined the fetch and nothing is cached.
    pub async fn with_cache<F, Fut>(&self, key: &str, fetcher: F, ttl: Option<Duration>) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let pending = {
            let mut state = self.inner.state.lock();

            if let Some(value) = state.store.get(key) {
                self.inner.metrics.record_hit();
                prometheus::record_cache_hit("api");
                return Ok(value);
            }

            if let Some(existing) = state.in_flight.get(key) {
                self.inner.metrics.record_deduplicated();
                tracing::debug!(key = %key, "Joining in-flight fetch");
                existing.clone()
            } else {
                self.inner.metrics.record_miss();
                self.inner.metrics.record_fetch();
                prometheus::record_cache_miss("api");

                let ttl = ttl.unwrap_or(self.inner.config.default_ttl);
                let inner = Arc::clone(&self.inner);
                let owned_key = key.to_string();
                let fetch = fetcher();

                // settle() needs the lock we hold, so the marker below is
                // always registered before it can be removed.
                let handle = tokio::spawn(async move {
                    let result = catch_panic(fetch).await;
                    inner.settle(&owned_key, &result, ttl);
                    result
                });

                let shared = async move {
                    handle
                        .await
                        .unwrap_or_else(|e| Err(ReqflowError::internal(format!("fetch task failed: {}", e))))
                }
                .boxed()
                .shared();

                state.in_flight.insert(key.to_string(), shared.clone());
                shared
            }
        };

        pending.await
    }

    /// Remove all expired entries
    pub fn sweep_expired(&self) -> usize {
        let (removed, len) = {
            let mut state = self.inner.state.lock();
            (state.store.evict_expired(), state.store.len())
        };
        if removed > 0 {
            self.inner.metrics.record_expirations(removed);
            tracing::debug!(removed, remaining = len, "Swept expired cache entries");
        }
        prometheus::set_cache_size("api", len as u64);
        removed
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.inner.state.lock().store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of fetches currently in flight
    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().in_flight.len()
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        self.inner.metrics.snapshot(self.len())
    }

    /// Get the cache configuration
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }
}

#[async_trait]
impl<V: Clone + Send + Sync + 'static> Tick for ApiCache<V> {
    fn name(&self) -> &'static str {
        "api-cache"
    }

    async fn tick(&self) {
        self.sweep_expired();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache(capacity: usize) -> ApiCache<String> {
        ApiCache::new(CacheConfig {
            capacity,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_cache_basic() {
        let cache = cache(10);
        assert!(cache.get("k").is_none());

        cache.set("k", "v".to_string(), None);
        assert_eq!(cache.get("k"), Some("v".to_string()));
        assert!(cache.has("k"));

        assert!(cache.delete("k"));
        assert!(!cache.has("k"));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_capacity_bound() {
        let cache = cache(8);
        for i in 0..100 {
            cache.set(format!("k{}", i), i.to_string(), None);
            assert!(cache.len() <= 8);
        }
        assert!(cache.stats().evictions > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let cache = cache(10);
        cache.set("k", "v".to_string(), Some(Duration::from_millis(100)));

        tokio::time::advance(Duration::from_millis(150)).await;

        assert!(cache.get("k").is_none());
        assert!(!cache.has("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_expired() {
        let cache = cache(10);
        cache.set("a", "1".to_string(), Some(Duration::from_millis(10)));
        cache.set("b", "2".to_string(), Some(Duration::from_millis(10)));
        cache.set("c", "3".to_string(), None);

        tokio::time::advance(Duration::from_millis(50)).await;
        cache.tick().await;

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().expirations, 2);
    }

    #[tokio::test]
    async fn test_clear_by_pattern() {
        let cache = cache(10);
        cache.set("profile:1", "a".to_string(), None);
        cache.set("profile:2", "b".to_string(), None);
        cache.set("posts:1", "c".to_string(), None);

        assert_eq!(cache.clear_by_pattern("^profile:").unwrap(), 2);
        assert!(cache.has("posts:1"));

        assert!(matches!(
            cache.clear_by_pattern("(unclosed"),
            Err(ReqflowError::InvalidRequest(_))
        ));

        cache.clear();
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_cache_deduplicates() {
        let cache = cache(10);
        let calls = Arc::new(AtomicUsize::new(0));

        let fetch = |calls: Arc<AtomicUsize>| {
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok("fresh".to_string())
            }
        };

        let (a, b) = tokio::join!(
            cache.with_cache("k", fetch(calls.clone()), None),
            cache.with_cache("k", fetch(calls.clone()), None),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.unwrap(), "fresh");
        assert_eq!(b.unwrap(), "fresh");
        assert_eq!(cache.in_flight(), 0);
        assert_eq!(cache.stats().deduplicated, 1);

        // Now served from the cache without another fetch
        let c = cache.with_cache("k", fetch(calls.clone()), None).await;
        assert_eq!(c.unwrap(), "fresh");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_cache_failure_propagates_and_is_not_cached() {
        let cache = cache(10);

        let failing = || async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err::<String, _>(ReqflowError::backend("boom"))
        };

        let (a, b) = tokio::join!(
            cache.with_cache("k", failing, None),
            cache.with_cache("k", failing, None),
        );
        assert_eq!(a, Err(ReqflowError::backend("boom")));
        assert_eq!(b, Err(ReqflowError::backend("boom")));
        assert!(!cache.has("k"));
        assert_eq!(cache.in_flight(), 0);
        assert_eq!(cache.stats().fetch_failures, 1);

        // Marker was released so a retry starts a fresh fetch
        let ok = cache
            .with_cache("k", || async { Ok("ok".to_string()) }, None)
            .await;
        assert_eq!(ok.unwrap(), "ok");
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_fetch_releases_marker() {
        let cache = cache(10);

        let panicking = || async {
            if true {
                panic!("fetcher blew up");
            }
            Ok("never".to_string())
        };
        let first = cache.with_cache("k", panicking, None).await;
        assert!(matches!(first, Err(ReqflowError::Internal(_))));
        assert_eq!(cache.in_flight(), 0);
        assert_eq!(cache.stats().fetch_failures, 1);

        let second = cache
            .with_cache("k", || async { Ok("fresh".to_string()) }, None)
            .await;
        assert_eq!(second.unwrap(), "fresh");
        assert_eq!(cache.get("k"), Some("fresh".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_fetch_still_populates_cache() {
        let cache = cache(10);
        let slow = || async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok("late".to_string())
        };

        let attempt =
            tokio::time::timeout(Duration::from_millis(10), cache.with_cache("k", slow, None)).await;
        assert!(attempt.is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(cache.get("k"), Some("late".to_string()));
    }
}
