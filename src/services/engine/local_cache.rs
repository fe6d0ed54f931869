// Engine-internal LRU cache
//
// Bounded in-memory cache with least-recently-used eviction over key access.
// The engine keeps one per internal concern (prepared plans, ...) and never
// spills to disk.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Slot<V> {
    value: V,
    /// Logical clock value of the last access
    last_access: u64,
}

struct Inner<K, V> {
    entries: HashMap<K, Slot<V>>,
    clock: u64,
    stats: CacheStats,
}

/// LRU cache keyed by `K`
///
/// A capacity of 0 means unbounded.
pub struct LocalCache<K, V> {
    name: String,
    capacity: usize,
    inner: Mutex<Inner<K, V>>,
}

impl<K, V> LocalCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(name: &str, capacity: usize) -> Self {
        Self {
            name: name.to_string(),
            capacity,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                clock: 0,
                stats: CacheStats::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.lock();
        inner.clock += 1;
        let now = inner.clock;

        match inner.entries.get_mut(key) {
            Some(slot) => {
                slot.last_access = now;
                let value = slot.value.clone();
                inner.stats.hits += 1;
                Some(value)
            }
            None => {
                inner.stats.misses += 1;
                None
            }
        }
    }

    /// Insert or replace, evicting the least recently used entry when full
    pub fn put(&self, key: K, value: V) -> Option<V> {
        let mut inner = self.lock();
        inner.clock += 1;
        let now = inner.clock;

        if self.capacity > 0 && inner.entries.len() >= self.capacity && !inner.entries.contains_key(&key) {
            Self::evict_lru(&mut inner, &self.name);
        }

        inner
            .entries
            .insert(key, Slot { value, last_access: now })
            .map(|slot| slot.value)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.lock().entries.remove(key).map(|slot| slot.value)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.lock().entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        let count = inner.entries.len();
        inner.entries.clear();
        tracing::debug!("Cleared {} entries from local cache '{}'", count, self.name);
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().stats.clone()
    }

    fn evict_lru(inner: &mut Inner<K, V>, name: &str) {
        let oldest = inner
            .entries
            .iter()
            .min_by_key(|(_, slot)| slot.last_access)
            .map(|(key, _)| key.clone());

        if let Some(key) = oldest {
            inner.entries.remove(&key);
            inner.stats.evictions += 1;
            tracing::trace!("Evicted entry from local cache '{}'", name);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K, V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Creates the engine's internal caches with one shared capacity
#[derive(Debug, Clone, Copy)]
pub struct LocalCacheFactory {
    capacity: usize,
}

impl LocalCacheFactory {
    pub fn new(capacity: usize) -> Self {
        Self { capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn get<K, V>(&self, name: &str) -> Arc<LocalCache<K, V>>
    where
        K: Eq + Hash + Clone,
        V: Clone,
    {
        tracing::debug!("Creating local cache '{}' (capacity {})", name, self.capacity);
        Arc::new(LocalCache::new(name, self.capacity))
    }
}
