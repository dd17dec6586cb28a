//! Image retention strategies.

use bytes::Bytes;
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};

/// A decoded image shared between the cache and its users
#[derive(Debug, Clone, PartialEq)]
pub struct CachedImage {
    pub url: String,
    pub data: Bytes,
}

impl CachedImage {
    pub fn new(url: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            url: url.into(),
            data: data.into(),
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Where cached images live
pub trait ImageRetention: Send {
    /// Store an image, returning the url of another image pushed out to make room
    fn insert(&mut self, url: String, image: Arc<CachedImage>) -> Option<String>;

    fn get(&mut self, url: &str) -> Option<Arc<CachedImage>>;

    /// Drop references whose image is gone. Returns how many were removed.
    fn reap(&mut self) -> usize;

    fn clear(&mut self);

    /// Number of tracked urls, including not yet reaped dead ones
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Holds images through `Weak` references only
#[derive(Default)]
pub struct WeakImageCache {
    images: HashMap<String, Weak<CachedImage>>,
}

impl WeakImageCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ImageRetention for WeakImageCache {
    fn insert(&mut self, url: String, image: Arc<CachedImage>) -> Option<String> {
        self.images.insert(url, Arc::downgrade(&image));
        None
    }

    fn get(&mut self, url: &str) -> Option<Arc<CachedImage>> {
        let upgraded = self.images.get(url)?.upgrade();
        if upgraded.is_none() {
            self.images.remove(url);
        }
        upgraded
    }

    fn reap(&mut self) -> usize {
        let before = self.images.len();
        self.images.retain(|_, weak| weak.strong_count() > 0);
        before - self.images.len()
    }

    fn clear(&mut self) {
        self.images.clear();
    }

    fn len(&self) -> usize {
        self.images.len()
    }
}

/// Owns up to `capacity` images, evicting the least recently used
pub struct StrongImageCache {
    images: LruCache<String, Arc<CachedImage>>,
}

impl StrongImageCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            images: LruCache::new(capacity),
        }
    }
}

impl ImageRetention for StrongImageCache {
    fn insert(&mut self, url: String, image: Arc<CachedImage>) -> Option<String> {
        // push also hands back the old pair when the url was already cached
        let (displaced, _) = self.images.push(url.clone(), image)?;
        (displaced != url).then_some(displaced)
    }

    fn get(&mut self, url: &str) -> Option<Arc<CachedImage>> {
        self.images.get(url).cloned()
    }

    fn reap(&mut self) -> usize {
        0
    }

    fn clear(&mut self) {
        self.images.clear();
    }

    fn len(&self) -> usize {
        self.images.len()
    }
}
