//! Bounded in-process cache with LRU eviction and per-entry TTL.
//!
//! A single mutex guards the eviction list and the index. Expired entries are
//! dropped lazily on read; a periodic sweep removes the rest so long-idle
//! entries do not pin memory until their key is touched again.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

pub struct Cache<K: Hash + Eq, V: Clone> {
    inner: Mutex<LruCache<K, Entry<V>>>,
    ttl: Duration,
}

impl<K: Hash + Eq, V: Clone> Cache<K, V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        Cache {
            inner: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Fetch a value, promoting it to most-recently-used. A hit on an expired
    /// entry deletes it and reports a miss.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        if let Some(entry) = inner.peek(key) {
            if entry.expires_at <= Instant::now() {
                inner.pop(key);
                return None;
            }
        }
        inner.get(key).map(|entry| entry.value.clone())
    }

    /// Insert or replace, refreshing both TTL and recency. The least-recently
    /// used entry is evicted when the cache is over capacity.
    pub fn insert(&self, key: K, value: V) {
        let entry = Entry {
            value,
            expires_at: Instant::now() + self.ttl,
        };
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        inner.put(key, entry);
    }

    pub fn remove(&self, key: &K) -> bool {
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        inner.pop(key).is_some()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        inner.clear();
    }

    /// Remove every expired entry, returning how many were dropped.
    pub fn cleanup_expired(&self) -> usize
    where
        K: Clone,
    {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        let expired: Vec<K> = inner
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            inner.pop(key);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
