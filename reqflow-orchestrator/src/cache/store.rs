//! Bounded key/value store with per-entry TTL and access-count eviction.

use regex::Regex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// A cached value with the bookkeeping needed for expiry and eviction
struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    ttl: Duration,
    access_count: u64,
}

impl<V> CacheEntry<V> {
    fn new(value: V, ttl: Duration) -> Self {
        Self {
            value,
            created_at: Instant::now(),
            ttl,
            access_count: 0,
        }
    }

    fn is_expired(&self) -> bool {
        self.created_at.elapsed() > self.ttl
    }
}

/// Capacity-bounded store.
///
/// Expired entries are treated as absent and removed on read. When an insert
/// of a new key would exceed capacity, the least-accessed entries (oldest
/// first on ties) are evicted in bulk.
pub struct BoundedStore<V> {
    entries: HashMap<String, CacheEntry<V>>,
    capacity: usize,
    evict_ratio: f64,
}

impl<V: Clone> BoundedStore<V> {
    /// Create a new store with the given capacity and eviction fraction
    pub fn new(capacity: usize, evict_ratio: f64) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: HashMap::with_capacity(capacity),
            capacity,
            evict_ratio: evict_ratio.clamp(0.0, 1.0),
        }
    }

    /// Read a live entry, counting the access
    pub fn get(&mut self, key: &str) -> Option<V> {
        if self.remove_if_expired(key) {
            return None;
        }
        let entry = self.entries.get_mut(key)?;
        entry.access_count += 1;
        Some(entry.value.clone())
    }

    /// Whether a live entry exists. Does not count as an access.
    pub fn has(&mut self, key: &str) -> bool {
        !self.remove_if_expired(key) && self.entries.contains_key(key)
    }

    fn remove_if_expired(&mut self, key: &str) -> bool {
        let expired = self.entries.get(key).is_some_and(CacheEntry::is_expired);
        if expired {
            self.entries.remove(key);
        }
        expired
    }

    /// Insert or replace an entry. Returns how many entries were evicted.
    pub fn set(&mut self, key: String, value: V, ttl: Duration) -> usize {
        let evicted = if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.evict()
        } else {
            0
        };
        self.entries.insert(key, CacheEntry::new(value, ttl));
        evicted
    }

    pub fn delete(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Remove every key matching the pattern
    pub fn clear_by_pattern(&mut self, pattern: &Regex) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| !pattern.is_match(key));
        before - self.entries.len()
    }

    /// Remove expired entries (call periodically for cleanup)
    pub fn evict_expired(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        before - self.entries.len()
    }

    /// Drop the lowest-ranked fraction of entries, at least one
    fn evict(&mut self) -> usize {
        let mut ranked: Vec<(u64, Instant, String)> = self
            .entries
            .iter()
            .map(|(key, entry)| (entry.access_count, entry.created_at, key.clone()))
            .collect();
        ranked.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

        let count = ((ranked.len() as f64 * self.evict_ratio).ceil() as usize).max(1);
        for (_, _, key) in ranked.into_iter().take(count) {
            self.entries.remove(&key);
        }

        tracing::debug!(evicted = count, capacity = self.capacity, "Cache eviction");
        count
    }

    /// Get the current number of entries (including not yet swept expired ones)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_set_and_get() {
        let mut store = BoundedStore::new(10, 0.2);
        store.set("a".to_string(), 1, HOUR);

        assert_eq!(store.get("a"), Some(1));
        assert!(store.has("a"));
        assert_eq!(store.get("b"), None);
    }

    #[test]
    fn test_capacity_never_exceeded() {
        let mut store = BoundedStore::new(5, 0.2);
        for i in 0..50 {
            store.set(format!("k{}", i), i, HOUR);
            assert!(store.len() <= 5);
        }
    }

    #[test]
    fn test_eviction_prefers_least_accessed() {
        let mut store = BoundedStore::new(3, 0.2);
        store.set("hot".to_string(), 1, HOUR);
        store.set("warm".to_string(), 2, HOUR);
        store.set("cold".to_string(), 3, HOUR);

        store.get("hot");
        store.get("hot");
        store.get("warm");

        // ceil(3 * 0.2) = 1 entry goes: the never-read one
        let evicted = store.set("new".to_string(), 4, HOUR);
        assert_eq!(evicted, 1);
        assert!(!store.has("cold"));
        assert!(store.has("hot"));
        assert!(store.has("warm"));
        assert!(store.has("new"));
    }

    #[test]
    fn test_replacing_existing_key_does_not_evict() {
        let mut store = BoundedStore::new(2, 0.5);
        store.set("a".to_string(), 1, HOUR);
        store.set("b".to_string(), 2, HOUR);

        assert_eq!(store.set("a".to_string(), 10, HOUR), 0);
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("a"), Some(10));
    }

    #[test]
    fn test_bulk_eviction_fraction() {
        let mut store = BoundedStore::new(10, 0.2);
        for i in 0..10 {
            store.set(format!("k{}", i), i, HOUR);
        }
        assert_eq!(store.set("extra".to_string(), 99, HOUR), 2);
        assert_eq!(store.len(), 9);
    }

    #[test]
    fn test_clear_by_pattern() {
        let mut store = BoundedStore::new(10, 0.2);
        store.set("orders:1".to_string(), 1, HOUR);
        store.set("orders:2".to_string(), 2, HOUR);
        store.set("users:1".to_string(), 3, HOUR);

        let pattern = Regex::new("^orders:").unwrap();
        assert_eq!(store.clear_by_pattern(&pattern), 2);
        assert_eq!(store.len(), 1);
        assert!(store.has("users:1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiration() {
        let mut store = BoundedStore::new(10, 0.2);
        store.set("k".to_string(), "v", Duration::from_millis(100));
        store.set("long".to_string(), "v", HOUR);

        tokio::time::advance(Duration::from_millis(150)).await;

        assert_eq!(store.get("k"), None);
        assert_eq!(store.len(), 1);
        assert_eq!(store.evict_expired(), 0);
        assert!(store.has("long"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_expired_sweep() {
        let mut store = BoundedStore::new(10, 0.2);
        for i in 0..4 {
            store.set(format!("k{}", i), i, Duration::from_millis(10));
        }
        tokio::time::advance(Duration::from_millis(20)).await;
        assert_eq!(store.evict_expired(), 4);
        assert!(store.is_empty());
    }
}
