//! In-memory metadata cache with request coalescing.
//!
//! Each key maps to a shared `OnceCell`, so concurrent misses on the same key
//! run a single load and every caller receives the same `Arc`. Entries never
//! expire on their own; LRU pressure evicts them and the resolver reloads
//! evicted keys from the local store.
//!
//! # Failure behavior
//!
//! Failed loads are not cached. A caller waiting on a load that fails runs the
//! load itself afterwards, one at a time.

use crate::error::Result;
use lru::LruCache;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};

type Slot<V> = Arc<OnceCell<Arc<V>>>;

/// Keyed cache whose misses are coalesced per key.
pub struct CoalescingCache<V> {
    name: &'static str,
    entries: Mutex<LruCache<String, Slot<V>>>,
    capacity: usize,
    hits: AtomicU64,
    loads: AtomicU64,
}

impl<V: Send + Sync + 'static> CoalescingCache<V> {
    /// Create a cache holding at most `capacity` keys (minimum 1).
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name,
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
            capacity,
            hits: AtomicU64::new(0),
            loads: AtomicU64::new(0),
        }
    }

    async fn slot(&self, key: &str) -> Slot<V> {
        let mut entries = self.entries.lock().await;
        if let Some(slot) = entries.get(key) {
            return Arc::clone(slot);
        }
        let slot: Slot<V> = Arc::new(OnceCell::new());
        entries.put(key.to_string(), Arc::clone(&slot));
        slot
    }

    /// Return the cached value for `key`, running `load` on a miss.
    pub async fn get_or_load<F, Fut>(&self, key: &str, load: F) -> Result<Arc<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let slot = self.slot(key).await;
        if let Some(value) = slot.get() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(cache = self.name, key = %key, "Cache hit");
            return Ok(Arc::clone(value));
        }

        let value = slot
            .get_or_try_init(|| async move {
                self.loads.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(cache = self.name, key = %key, "Cache miss, loading");
                load().await.map(Arc::new)
            })
            .await?;
        Ok(Arc::clone(value))
    }

    /// Cached value without loading
    pub async fn peek(&self, key: &str) -> Option<Arc<V>> {
        let entries = self.entries.lock().await;
        entries.peek(key).and_then(|slot| slot.get().cloned())
    }

    /// Replace the entry for `key` wholesale.
    pub async fn insert(&self, key: &str, value: V) -> Arc<V> {
        let value = Arc::new(value);
        let slot = OnceCell::new_with(Some(Arc::clone(&value)));
        self.entries
            .lock()
            .await
            .put(key.to_string(), Arc::new(slot));
        tracing::debug!(cache = self.name, key = %key, "Cache entry replaced");
        value
    }

    /// Drop the entry for `key`; returns whether a loaded value was present.
    pub async fn invalidate(&self, key: &str) -> bool {
        let removed = self.entries.lock().await.pop(key);
        removed.is_some_and(|slot| slot.initialized())
    }

    /// Drop every entry.
    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }

    /// Get cache statistics.
    pub async fn stats(&self) -> CacheStats {
        let entries = self.entries.lock().await;
        CacheStats {
            name: self.name,
            entries: entries.iter().filter(|(_, slot)| slot.initialized()).count(),
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
        }
    }
}

/// Cache statistics for monitoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub name: &'static str,
    /// Keys currently holding a value
    pub entries: usize,
    pub capacity: usize,
    /// Lookups answered from memory
    pub hits: u64,
    /// Loads started on a miss
    pub loads: u64,
}
