//! In-memory response store.

use super::key::CacheKey;
use crate::config::CacheConfig;
use lru::LruCache;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub expired: u64,
    pub entries: usize,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Entry<V> {
    value: V,
    stored_at: Instant,
}

/// LRU-bounded cache whose entries also expire after a TTL.
pub struct ResponseCache<V> {
    entries: Mutex<LruCache<String, Entry<V>>>,
    ttl: Duration,
    enabled: bool,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    expired: AtomicU64,
}

impl<V: Clone> ResponseCache<V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self::build(capacity, ttl, true)
    }

    pub fn from_config(cfg: &CacheConfig) -> Self {
        Self::build(cfg.capacity, cfg.ttl, cfg.enabled)
    }

    /// A cache that never stores anything.
    pub fn disabled() -> Self {
        Self::build(1, Duration::ZERO, false)
    }

    fn build(capacity: usize, ttl: Duration, enabled: bool) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
            enabled,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn get(&self, key: &CacheKey) -> Option<V> {
        if !self.enabled {
            return None;
        }
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let lookup = entries
            .get(key.as_str())
            .map(|e| (e.stored_at.elapsed() <= self.ttl).then(|| e.value.clone()));
        let fresh = match lookup {
            Some(Some(value)) => Some(value),
            Some(None) => {
                entries.pop(key.as_str());
                self.expired.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => None,
        };
        match fresh {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        fresh
    }

    pub fn insert(&self, key: &CacheKey, value: V) {
        if !self.enabled {
            return;
        }
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).put(
            key.hash.clone(),
            Entry {
                value,
                stored_at: Instant::now(),
            },
        );
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop(key.as_str())
            .is_some()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            entries: self.entries.lock().map(|e| e.len()).unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(q: &str) -> CacheKey {
        CacheKey::for_query(None, q, None)
    }

    #[test]
    fn test_hit_and_miss() {
        let cache = ResponseCache::new(4, Duration::from_secs(60));
        assert!(cache.get(&key("a")).is_none());
        cache.insert(&key("a"), "SELECT 1".to_string());
        assert_eq!(cache.get(&key("a")).as_deref(), Some("SELECT 1"));
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.sets), (1, 1, 1));
        assert!((stats.hit_ratio() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_entries_expire() {
        let cache = ResponseCache::new(4, Duration::from_millis(10));
        cache.insert(&key("a"), 1u32);
        std::thread::sleep(Duration::from_millis(25));
        assert!(cache.get(&key("a")).is_none());
        assert_eq!(cache.stats().expired, 1);
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = ResponseCache::new(2, Duration::from_secs(60));
        cache.insert(&key("a"), 1u32);
        cache.insert(&key("b"), 2u32);
        assert!(cache.get(&key("a")).is_some());
        cache.insert(&key("c"), 3u32);
        assert!(cache.get(&key("b")).is_none());
        assert!(cache.get(&key("a")).is_some());
    }

    #[test]
    fn test_disabled_cache_stores_nothing() {
        let cache: ResponseCache<u32> = ResponseCache::disabled();
        cache.insert(&key("a"), 1);
        assert!(cache.get(&key("a")).is_none());
        assert_eq!(cache.stats().sets, 0);
    }
}
