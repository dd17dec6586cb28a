//! Size-bounded auxiliary cache for data and images.
//!
//! Data entries are JSON values charged against a byte budget by their
//! serialized length and evicted least-recently-accessed first. Images are
//! held through an [`ImageRetention`] strategy picked once from config.

mod config;
mod retention;

pub use config::{MemoryConfig, RetentionStrategy};
pub use retention::{CachedImage, ImageRetention, StrongImageCache, WeakImageCache};

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

use crate::metrics::prometheus;
use crate::ticker::Tick;

struct MemoryEntry {
    value: Value,
    size: usize,
    cached_at: Instant,
}

struct MemoryState {
    /// Ordered by last access
    data: LruCache<String, MemoryEntry>,
    total_bytes: usize,
    images: Box<dyn ImageRetention>,
}

impl MemoryState {
    fn remove_lru(&mut self) -> Option<String> {
        let (key, entry) = self.data.pop_lru()?;
        self.total_bytes -= entry.size;
        Some(key)
    }
}

/// Snapshot of memory bounder statistics
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub entries: usize,
    pub bytes: usize,
    pub max_bytes: usize,
    pub images: usize,
    pub evictions: u64,
    pub rejected: u64,
    pub cleanups: u64,
}

/// Byte-budgeted data cache plus image retention
pub struct MemoryOptimizer {
    state: Mutex<MemoryState>,
    config: MemoryConfig,
    evictions: AtomicU64,
    rejected: AtomicU64,
    cleanups: AtomicU64,
}

impl MemoryOptimizer {
    pub fn new(config: MemoryConfig) -> Self {
        let images: Box<dyn ImageRetention> = match config.retention {
            RetentionStrategy::Weak => Box::new(WeakImageCache::new()),
            RetentionStrategy::Strong => Box::new(StrongImageCache::new(config.image_capacity)),
        };

        Self {
            state: Mutex::new(MemoryState {
                data: LruCache::unbounded(),
                total_bytes: 0,
                images,
            }),
            config,
            evictions: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            cleanups: AtomicU64::new(0),
        }
    }

    /// Cache a value, evicting least-recently-accessed entries until it fits.
    ///
    /// Returns `false` when the value alone exceeds the whole budget.
    pub fn cache_data(&self, key: impl Into<String>, value: Value) -> bool {
        let key = key.into();
        let size = estimate_size(&value);

        if size > self.config.max_bytes {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                key = %key,
                size,
                max_bytes = self.config.max_bytes,
                "Value exceeds memory budget, not cached"
            );
            return false;
        }

        let mut state = self.state.lock();
        if let Some(old) = state.data.pop(&key) {
            state.total_bytes -= old.size;
        }

        let mut evicted = 0u64;
        while state.total_bytes + size > self.config.max_bytes {
            match state.remove_lru() {
                Some(old_key) => {
                    evicted += 1;
                    tracing::debug!(key = %old_key, "Evicted to fit memory budget");
                }
                None => break,
            }
        }

        state.total_bytes += size;
        state.data.put(
            key,
            MemoryEntry {
                value,
                size,
                cached_at: Instant::now(),
            },
        );

        if evicted > 0 {
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
            prometheus::record_cache_evictions("memory", evicted);
        }
        prometheus::set_memory_bytes(state.total_bytes as u64);
        true
    }

    /// Read a cached value, marking it as recently accessed
    pub fn get_cached_data(&self, key: &str) -> Option<Value> {
        let value = self.state.lock().data.get(key).map(|entry| entry.value.clone());
        if value.is_some() {
            prometheus::record_cache_hit("memory");
        } else {
            prometheus::record_cache_miss("memory");
        }
        value
    }

    pub fn cache_image(&self, url: impl Into<String>, image: Arc<CachedImage>) {
        if let Some(evicted) = self.state.lock().images.insert(url.into(), image) {
            tracing::trace!(url = %evicted, "Image evicted");
        }
    }

    /// Look up an image. Under weak retention an image nobody else holds is gone.
    pub fn get_cached_image(&self, url: &str) -> Option<Arc<CachedImage>> {
        self.state.lock().images.get(url)
    }

    /// Shrink to the most recently accessed fraction of entries and drop all images
    pub fn aggressive_cleanup(&self) -> usize {
        let mut state = self.state.lock();
        let keep = (state.data.len() as f64 * self.config.keep_ratio).floor() as usize;

        let mut removed = 0;
        while state.data.len() > keep && state.remove_lru().is_some() {
            removed += 1;
        }
        state.images.clear();

        self.cleanups.fetch_add(1, Ordering::Relaxed);
        prometheus::set_memory_bytes(state.total_bytes as u64);
        tracing::info!(removed, kept = state.data.len(), "Aggressive memory cleanup");
        removed
    }

    pub fn clear_all(&self) {
        let mut state = self.state.lock();
        state.data.clear();
        state.total_bytes = 0;
        state.images.clear();
        prometheus::set_memory_bytes(0);
    }

    /// Reap dead image references and drop data older than `max_age`
    pub fn sweep(&self) -> usize {
        let mut state = self.state.lock();
        let max_age = self.config.max_age;

        let stale: Vec<String> = state
            .data
            .iter()
            .filter(|(_, entry)| entry.cached_at.elapsed() > max_age)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &stale {
            if let Some(entry) = state.data.pop(key) {
                state.total_bytes -= entry.size;
            }
        }
        let reaped = state.images.reap();

        if !stale.is_empty() || reaped > 0 {
            tracing::debug!(stale = stale.len(), reaped, "Memory sweep");
        }
        prometheus::set_memory_bytes(state.total_bytes as u64);
        stale.len() + reaped
    }

    /// Estimated bytes currently held
    pub fn used_bytes(&self) -> usize {
        self.state.lock().total_bytes
    }

    pub fn len(&self) -> usize {
        self.state.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> MemoryStats {
        let state = self.state.lock();
        MemoryStats {
            entries: state.data.len(),
            bytes: state.total_bytes,
            max_bytes: self.config.max_bytes,
            images: state.images.len(),
            evictions: self.evictions.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            cleanups: self.cleanups.load(Ordering::Relaxed),
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }
}

#[async_trait]
impl Tick for MemoryOptimizer {
    fn name(&self) -> &'static str {
        "memory-optimizer"
    }

    async fn tick(&self) {
        self.sweep();
    }
}

/// Serialized JSON length
fn estimate_size(value: &Value) -> usize {
    serde_json::to_vec(value).map(|bytes| bytes.len()).unwrap_or(0)
}
