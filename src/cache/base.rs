//! The shared base for all cache tiers: a bounded map with TTL expiry and
//! an LRU eviction policy that gives hot entries a slight tenure preference.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTier {
    Embedding,
    QueryResult,
    RetrievalClassifier,
}

impl CacheTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheTier::Embedding => "embedding",
            CacheTier::QueryResult => "query_result",
            CacheTier::RetrievalClassifier => "retrieval_classifier",
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted: Instant,
    ttl: Duration,
    hits: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self) -> bool {
        self.inserted.elapsed() > self.ttl
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub tier: &'static str,
    pub total_requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub size: usize,
    pub max_size: usize,
}

/// The lock-free core of a cache tier. `TierCache` wraps this in a mutex;
/// the query-result tier embeds it directly so its inverted index can share
/// the same critical section.
pub struct CacheCore<V> {
    tier: CacheTier,
    max_size: usize,
    default_ttl: Duration,
    entries: HashMap<String, CacheEntry<V>>,
    total_requests: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<V: Clone> CacheCore<V> {
    pub fn new(tier: CacheTier, max_size: usize, default_ttl: Duration) -> Self {
        Self {
            tier,
            max_size,
            default_ttl,
            entries: HashMap::new(),
            total_requests: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    /// Look a key up, counting the request. Expired entries are dropped on
    /// access; the removed key is handed back so callers maintaining side
    /// indices can clean up.
    pub fn get(&mut self, key: &str) -> (Option<V>, Option<String>) {
        self.total_requests += 1;

        match self.entries.get_mut(key) {
            Some(entry) if !entry.is_expired() => {
                entry.hits += 1;
                self.hits += 1;
                (Some(entry.value.clone()), None)
            }
            Some(_) => {
                self.entries.remove(key);
                self.misses += 1;
                (None, Some(key.to_owned()))
            }
            None => {
                self.misses += 1;
                (None, None)
            }
        }
    }

    /// Insert a value, returning every key that was removed to make room
    /// (expired entries plus at most one eviction).
    pub fn set(&mut self, key: String, value: V, ttl: Option<Duration>) -> Vec<String> {
        let mut removed = self.drop_expired();

        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_size {
            // LRU with a tenure preference: the entry with the fewest hits
            // goes first, ties broken by insertion age.
            let victim = self
                .entries
                .iter()
                .min_by_key(|(_, e)| (e.hits, std::cmp::Reverse(e.inserted.elapsed())))
                .map(|(k, _)| k.clone());
            if let Some(victim) = victim {
                self.entries.remove(&victim);
                self.evictions += 1;
                removed.push(victim);
            }
        }

        self.entries.insert(
            key,
            CacheEntry {
                value,
                inserted: Instant::now(),
                ttl: ttl.unwrap_or(self.default_ttl),
                hits: 0,
            },
        );
        removed
    }

    pub fn delete(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn clear(&mut self) -> usize {
        let size = self.entries.len();
        self.entries.clear();
        size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn retain<F: FnMut(&str, &V) -> bool>(&mut self, mut keep: F) -> Vec<String> {
        let mut removed = Vec::new();
        self.entries.retain(|k, e| {
            let kept = keep(k, &e.value);
            if !kept {
                removed.push(k.clone());
            }
            kept
        });
        removed
    }

    fn drop_expired(&mut self) -> Vec<String> {
        let expired = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired())
            .map(|(k, _)| k.clone())
            .collect::<Vec<_>>();
        for key in &expired {
            self.entries.remove(key);
        }
        expired
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            tier: self.tier.as_str(),
            total_requests: self.total_requests,
            hits: self.hits,
            misses: self.misses,
            hit_rate: if self.total_requests == 0 {
                0.0
            } else {
                self.hits as f64 / self.total_requests as f64
            },
            evictions: self.evictions,
            size: self.entries.len(),
            max_size: self.max_size,
        }
    }
}

/// A cache tier safe to call from concurrent requests. All mutation runs in
/// one short critical section; contention is expected to be low.
pub struct TierCache<V> {
    inner: Mutex<CacheCore<V>>,
}

impl<V: Clone> TierCache<V> {
    pub fn new(tier: CacheTier, max_size: usize, default_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheCore::new(tier, max_size, default_ttl)),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.inner.lock().get(key).0
    }

    pub fn set(&self, key: String, value: V) {
        self.inner.lock().set(key, value, None);
    }

    pub fn set_with_ttl(&self, key: String, value: V, ttl: Duration) {
        self.inner.lock().set(key, value, Some(ttl));
    }

    pub fn delete(&self, key: &str) -> bool {
        self.inner.lock().delete(key)
    }

    pub fn clear(&self) -> usize {
        self.inner.lock().clear()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats()
    }
}

pub fn content_key(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cache(max: usize) -> TierCache<String> {
        TierCache::new(CacheTier::Embedding, max, Duration::from_secs(60))
    }

    #[test]
    fn test_set_then_get_returns_value() {
        let cache = small_cache(4);
        cache.set("k".into(), "v".into());
        assert_eq!(cache.get("k"), Some("v".to_owned()));
    }

    #[test]
    fn test_expired_entry_is_a_miss() {
        let cache = small_cache(4);
        cache.set_with_ttl("k".into(), "v".into(), Duration::ZERO);
        // Duration::ZERO expires as soon as any time has elapsed
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_eviction_prefers_cold_entries() {
        let cache = small_cache(2);
        cache.set("cold".into(), "1".into());
        cache.set("hot".into(), "2".into());
        // heat up "hot"
        cache.get("hot");
        cache.get("hot");
        cache.set("new".into(), "3".into());

        assert_eq!(cache.get("cold"), None);
        assert_eq!(cache.get("hot"), Some("2".to_owned()));
        assert_eq!(cache.get("new"), Some("3".to_owned()));
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let cache = small_cache(2);
        cache.set("a".into(), "1".into());
        cache.set("b".into(), "2".into());
        cache.set("a".into(), "3".into());
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), Some("3".to_owned()));
        assert_eq!(cache.get("b"), Some("2".to_owned()));
    }

    #[test]
    fn test_stats_track_hits_and_misses() {
        let cache = small_cache(4);
        cache.set("k".into(), "v".into());
        cache.get("k");
        cache.get("absent");

        let stats = cache.stats();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
    }

    #[test]
    fn test_delete_and_clear() {
        let cache = small_cache(4);
        cache.set("a".into(), "1".into());
        cache.set("b".into(), "2".into());
        assert!(cache.delete("a"));
        assert!(!cache.delete("a"));
        assert_eq!(cache.clear(), 1);
        assert!(cache.is_empty());
    }
}
