//! Reference-counted pool of realtime subscription channels.
//!
//! Channels are keyed by `(name, xxh3 of the serialized config)`. Identical
//! requests share one subscription; an unreferenced channel stays reusable
//! until the idle sweep tears it down.

mod config;

pub use config::PoolConfig;

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use xxhash_rust::xxh3::xxh3_64;

use reqflow_core::{ChannelConfig, ChannelHandle, RealtimeTransport, ReqflowError, Result};

use crate::metrics::prometheus;
use crate::ticker::Tick;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ChannelKey {
    name: String,
    config_hash: u64,
}

impl ChannelKey {
    fn new(name: &str, config: &ChannelConfig) -> Result<Self> {
        let serialized = serde_json::to_vec(config)?;
        Ok(Self {
            name: name.to_string(),
            config_hash: xxh3_64(&serialized),
        })
    }
}

struct PooledChannel {
    handle: ChannelHandle,
    ref_count: i64,
    last_used: Instant,
}

/// Snapshot of pool statistics
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub channels: usize,
    pub referenced: usize,
    pub idle: usize,
    pub created: u64,
    pub reused: u64,
    pub evicted: u64,
    pub exhausted: u64,
}

#[derive(Debug, Default)]
struct PoolMetrics {
    created: AtomicU64,
    reused: AtomicU64,
    evicted: AtomicU64,
    exhausted: AtomicU64,
}

/// Shares realtime channels between consumers
pub struct ConnectionPool {
    transport: Arc<dyn RealtimeTransport>,
    // Held across subscribe so a key never gets two channels
    channels: Mutex<HashMap<ChannelKey, PooledChannel>>,
    config: PoolConfig,
    metrics: PoolMetrics,
}

impl ConnectionPool {
    pub fn new(transport: Arc<dyn RealtimeTransport>, config: PoolConfig) -> Self {
        Self {
            transport,
            channels: Mutex::new(HashMap::new()),
            config,
            metrics: PoolMetrics::default(),
        }
    }

    /// Get a shared channel, subscribing on first use.
    ///
    /// At capacity the least recently used unreferenced channel is closed to
    /// make room; if every channel is referenced this fails with
    /// `PoolExhausted`.
    pub async fn get_channel(&self, name: &str, config: &ChannelConfig) -> Result<ChannelHandle> {
        let key = ChannelKey::new(name, config)?;
        let mut channels = self.channels.lock().await;

        if let Some(entry) = channels.get_mut(&key) {
            entry.ref_count += 1;
            entry.last_used = Instant::now();
            self.metrics.reused.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(channel = %name, ref_count = entry.ref_count, "Reusing pooled channel");
            return Ok(entry.handle.clone());
        }

        let victim = if channels.len() >= self.config.max_channels {
            let victim = channels
                .iter()
                .filter(|(_, entry)| entry.ref_count <= 0)
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone());

            if victim.is_none() {
                self.metrics.exhausted.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(channel = %name, max = self.config.max_channels, "Connection pool exhausted");
                return Err(ReqflowError::PoolExhausted {
                    max: self.config.max_channels,
                });
            }
            victim
        } else {
            None
        };

        // The idle victim is only closed once its replacement is open
        let handle = self.transport.subscribe(name, config).await?;

        if let Some(evicted) = victim.and_then(|victim| channels.remove(&victim)) {
            self.metrics.evicted.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(channel = %evicted.handle.name(), "Evicting idle channel to make room");
            self.close(&evicted.handle).await;
        }
        channels.insert(
            key,
            PooledChannel {
                handle: handle.clone(),
                ref_count: 1,
                last_used: Instant::now(),
            },
        );
        self.metrics.created.fetch_add(1, Ordering::Relaxed);
        prometheus::set_pool_channels(channels.len() as u64);
        tracing::debug!(channel = %name, id = handle.id(), "Opened channel");

        Ok(handle)
    }

    /// Drop one reference. The channel stays open for reuse until it idles out.
    pub async fn release_channel(&self, name: &str, config: &ChannelConfig) -> Result<bool> {
        let key = ChannelKey::new(name, config)?;
        let mut channels = self.channels.lock().await;

        match channels.get_mut(&key) {
            Some(entry) => {
                entry.ref_count -= 1;
                entry.last_used = Instant::now();
                tracing::debug!(channel = %name, ref_count = entry.ref_count, "Released channel");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Close and forget a channel regardless of its references
    pub async fn remove_channel(&self, name: &str, config: &ChannelConfig) -> Result<bool> {
        let key = ChannelKey::new(name, config)?;
        let mut channels = self.channels.lock().await;

        let Some(entry) = channels.remove(&key) else {
            return Ok(false);
        };
        prometheus::set_pool_channels(channels.len() as u64);
        tracing::debug!(channel = %name, ref_count = entry.ref_count, "Removing channel");
        self.transport.unsubscribe(&entry.handle).await?;
        Ok(true)
    }

    /// Close unreferenced channels idle longer than `idle_ttl`
    pub async fn sweep_idle(&self) -> usize {
        let mut channels = self.channels.lock().await;
        let idle_ttl = self.config.idle_ttl;

        let expired: Vec<ChannelKey> = channels
            .iter()
            .filter(|(_, entry)| entry.ref_count <= 0 && entry.last_used.elapsed() > idle_ttl)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            if let Some(entry) = channels.remove(key) {
                self.close(&entry.handle).await;
            }
        }

        if !expired.is_empty() {
            tracing::debug!(closed = expired.len(), remaining = channels.len(), "Idle channel sweep");
        }
        prometheus::set_pool_channels(channels.len() as u64);
        expired.len()
    }

    /// Close every channel
    pub async fn close_all(&self) -> usize {
        let mut channels = self.channels.lock().await;
        let count = channels.len();
        for (_, entry) in channels.drain() {
            self.close(&entry.handle).await;
        }
        prometheus::set_pool_channels(0);
        count
    }

    async fn close(&self, handle: &ChannelHandle) {
        if let Err(e) = self.transport.unsubscribe(handle).await {
            tracing::warn!(channel = %handle.name(), error = %e, "Failed to unsubscribe channel");
        }
    }

    /// Current references to a channel, if pooled
    pub async fn ref_count(&self, name: &str, config: &ChannelConfig) -> Option<i64> {
        let key = ChannelKey::new(name, config).ok()?;
        self.channels.lock().await.get(&key).map(|entry| entry.ref_count)
    }

    pub async fn len(&self) -> usize {
        self.channels.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.channels.lock().await.is_empty()
    }

    pub async fn stats(&self) -> PoolStats {
        let channels = self.channels.lock().await;
        let referenced = channels.values().filter(|entry| entry.ref_count > 0).count();

        PoolStats {
            channels: channels.len(),
            referenced,
            idle: channels.len() - referenced,
            created: self.metrics.created.load(Ordering::Relaxed),
            reused: self.metrics.reused.load(Ordering::Relaxed),
            evicted: self.metrics.evicted.load(Ordering::Relaxed),
            exhausted: self.metrics.exhausted.load(Ordering::Relaxed),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }
}

#[async_trait]
impl Tick for ConnectionPool {
    fn name(&self) -> &'static str {
        "connection-pool"
    }

    async fn tick(&self) {
        self.sweep_idle().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqflow_core::MemoryTransport;
    use serde_json::json;
    use std::time::Duration;

    fn pool(transport: Arc<MemoryTransport>, max_channels: usize) -> ConnectionPool {
        ConnectionPool::new(
            transport,
            PoolConfig {
                max_channels,
                ..Default::default()
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_requests_share_channel() {
        let transport = MemoryTransport::new();
        let pool = pool(transport.clone(), 10);
        let config = ChannelConfig::table("bids").event("INSERT");

        let a = pool.get_channel("auction-1", &config).await.unwrap();
        let b = pool.get_channel("auction-1", &config).await.unwrap();

        assert_eq!(a, b);
        assert_eq!(pool.ref_count("auction-1", &config).await, Some(2));
        assert_eq!(transport.subscribe_calls(), 1);

        assert!(pool.release_channel("auction-1", &config).await.unwrap());
        assert!(pool.release_channel("auction-1", &config).await.unwrap());
        assert_eq!(pool.ref_count("auction-1", &config).await, Some(0));

        // Still reusable until it idles out
        assert_eq!(pool.sweep_idle().await, 0);
        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(pool.sweep_idle().await, 1);

        assert!(pool.is_empty().await);
        assert_eq!(transport.open_channels(), 0);
    }

    #[tokio::test]
    async fn test_different_config_gets_own_channel() {
        let transport = MemoryTransport::new();
        let pool = pool(transport.clone(), 10);

        let a = pool
            .get_channel("auction-1", &ChannelConfig::table("bids").event("INSERT"))
            .await
            .unwrap();
        let b = pool
            .get_channel("auction-1", &ChannelConfig::table("bids").event("UPDATE"))
            .await
            .unwrap();

        assert_ne!(a, b);
        assert_eq!(pool.len().await, 2);
    }

    #[tokio::test]
    async fn test_events_fan_out_to_every_consumer() {
        let transport = MemoryTransport::new();
        let pool = pool(transport.clone(), 10);
        let config = ChannelConfig::table("bids");

        let mut first = pool.get_channel("feed", &config).await.unwrap().events();
        let mut second = pool.get_channel("feed", &config).await.unwrap().events();

        transport.emit("feed", "INSERT", json!({"amount": 5}));

        assert_eq!(first.recv().await.unwrap().payload, json!({"amount": 5}));
        assert_eq!(second.recv().await.unwrap().payload, json!({"amount": 5}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_lru_idle() {
        let transport = MemoryTransport::new();
        let pool = pool(transport.clone(), 2);
        let config = ChannelConfig::table("t");

        pool.get_channel("a", &config).await.unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;
        pool.get_channel("b", &config).await.unwrap();
        pool.release_channel("a", &config).await.unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;
        pool.release_channel("b", &config).await.unwrap();

        pool.get_channel("c", &config).await.unwrap();

        assert_eq!(pool.ref_count("a", &config).await, None);
        assert_eq!(pool.ref_count("b", &config).await, Some(0));
        assert_eq!(pool.stats().await.evicted, 1);
        assert_eq!(transport.open_channels(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_when_all_referenced() {
        let transport = MemoryTransport::new();
        let pool = pool(transport.clone(), 1);
        let config = ChannelConfig::table("t");

        pool.get_channel("a", &config).await.unwrap();
        let result = pool.get_channel("b", &config).await;

        assert_eq!(result, Err(ReqflowError::PoolExhausted { max: 1 }));
        assert_eq!(transport.subscribe_calls(), 1);
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn test_remove_channel_ignores_refs() {
        let transport = MemoryTransport::new();
        let pool = pool(transport.clone(), 10);
        let config = ChannelConfig::table("t");

        pool.get_channel("a", &config).await.unwrap();
        pool.get_channel("a", &config).await.unwrap();

        assert!(pool.remove_channel("a", &config).await.unwrap());
        assert!(!pool.remove_channel("a", &config).await.unwrap());
        assert_eq!(transport.open_channels(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_failure_creates_nothing() {
        let transport = MemoryTransport::new();
        transport.set_reject_subscribe(true);
        let pool = pool(transport.clone(), 10);

        let result = pool.get_channel("a", &ChannelConfig::table("t")).await;
        assert!(matches!(result, Err(ReqflowError::Backend(_))));
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn test_failed_subscribe_keeps_idle_channel() {
        let transport = MemoryTransport::new();
        let pool = pool(transport.clone(), 1);
        let config = ChannelConfig::table("t");

        pool.get_channel("a", &config).await.unwrap();
        pool.release_channel("a", &config).await.unwrap();

        transport.set_reject_subscribe(true);
        assert!(pool.get_channel("b", &config).await.is_err());

        assert_eq!(pool.ref_count("a", &config).await, Some(0));
        assert_eq!(transport.open_channels(), 1);
        assert_eq!(transport.unsubscribe_calls(), 0);
        assert_eq!(pool.stats().await.evicted, 0);

        transport.set_reject_subscribe(false);
        pool.get_channel("b", &config).await.unwrap();
        assert_eq!(pool.ref_count("a", &config).await, None);
        assert_eq!(transport.open_channels(), 1);
    }
}
