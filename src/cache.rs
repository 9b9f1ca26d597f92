//! Cache-aside layer in front of the catalog and metadata stores.
//!
//! Entries are immutable value snapshots, so concurrent misses on the same
//! key may both fetch and last-write-wins into the cache without locking
//! across the fetch. Nothing is cached on fetch failure, and callers never
//! invalidate; entries expire by TTL or fall off the LRU.

use lru::LruCache;
use std::future::Future;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

struct CachedEntry<V> {
    value: V,
    inserted_at: Instant,
}

/// A bounded get-or-populate cache with optional TTL.
pub struct AsideCache<K: Hash + Eq, V> {
    name: &'static str,
    entries: Mutex<LruCache<K, CachedEntry<V>>>,
    ttl: Option<Duration>,
}

impl<K: Hash + Eq + Clone, V: Clone> AsideCache<K, V> {
    /// Create a cache with the given entry capacity. `ttl` of `None` means
    /// entries never expire (only LRU eviction applies).
    pub fn new(name: &'static str, capacity: usize, ttl: Option<Duration>) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            name,
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Return the cached value for `key`, dropping it first if expired.
    pub async fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock().await;
        let expired = match entries.get(key) {
            Some(entry) => match self.ttl {
                Some(ttl) => entry.inserted_at.elapsed() >= ttl,
                None => false,
            },
            None => return None,
        };
        if expired {
            entries.pop(key);
            return None;
        }
        entries.get(key).map(|entry| entry.value.clone())
    }

    /// Return the cached value for `key`, or invoke `fetch(context)` and
    /// cache its result. A failed fetch caches nothing and propagates.
    ///
    /// The lock is not held across the fetch, so concurrent misses on the
    /// same key may both fetch; the values are identical snapshots and the
    /// later insert wins.
    pub async fn get_or_populate<C, F, Fut, E>(&self, key: K, context: C, fetch: F) -> Result<V, E>
    where
        F: FnOnce(C) -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(&key).await {
            metrics::counter!("retrieve.cache.hit", "cache" => self.name).increment(1);
            return Ok(value);
        }
        metrics::counter!("retrieve.cache.miss", "cache" => self.name).increment(1);

        let value = fetch(context).await?;

        let mut entries = self.entries.lock().await;
        entries.put(
            key,
            CachedEntry {
                value: value.clone(),
                inserted_at: Instant::now(),
            },
        );
        Ok(value)
    }
}
