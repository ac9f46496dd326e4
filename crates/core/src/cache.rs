use std::hash::Hash;
use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

/// Bounded LRU shared between the dedupe window, the plan baselines, and
/// anything else that needs strict least-recently-used eviction.
///
/// A single lock guards the whole cache; mutation never iterates, and
/// iteration snapshots. Callers hold the lock only for the duration of one
/// operation.
#[derive(Debug)]
pub struct SharedLru<K: Hash + Eq, V> {
    inner: Mutex<LruCache<K, V>>,
}

impl<K: Hash + Eq, V> SharedLru<K, V> {
    /// Capacity must be non-zero; configuration validation enforces that
    /// before construction.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Insert or refresh; evicts the least-recently-used entry at capacity.
    pub fn put(&self, key: K, value: V) {
        self.inner.lock().put(key, value);
    }

    /// Read without refreshing recency.
    pub fn peek_cloned(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.inner.lock().peek(key).cloned()
    }

    /// Read and refresh recency.
    pub fn get_cloned(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.inner.lock().get(key).cloned()
    }

    /// Mutate-in-place under the cache lock, inserting a default when absent.
    pub fn update_or_insert_with<F, D>(&self, key: K, default: D, f: F)
    where
        F: FnOnce(&mut V),
        D: FnOnce() -> V,
    {
        let mut cache = self.inner.lock();
        if let Some(v) = cache.get_mut(&key) {
            f(v);
            return;
        }
        let mut v = default();
        f(&mut v);
        cache.put(key, v);
    }

    pub fn pop(&self, key: &K) -> Option<V> {
        self.inner.lock().pop(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Snapshot of keys, oldest last. Used by compaction sweeps; never held
    /// across a mutation.
    pub fn keys_snapshot(&self) -> Vec<K>
    where
        K: Clone,
    {
        self.inner.lock().iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn retain<F>(&self, mut keep: F)
    where
        K: Clone,
        F: FnMut(&K, &V) -> bool,
    {
        let mut cache = self.inner.lock();
        let stale: Vec<K> = cache
            .iter()
            .filter(|(k, v)| !keep(k, v))
            .map(|(k, _)| k.clone())
            .collect();
        for k in stale {
            cache.pop(&k);
        }
    }
}
