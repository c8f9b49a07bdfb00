use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Stable 64-bit key for arbitrary content.
pub fn content_key(bytes: &[u8]) -> u64 {
    seahash::hash(bytes)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
}

/// Time-bounded memo table.
///
/// Entries expire `ttl` after insertion no matter how often they are read.
/// Over capacity, the entry inserted longest ago goes first; reads do not
/// refresh its position.
#[derive(Debug)]
pub struct TtlCache<V> {
    ttl: Duration,
    capacity: usize,
    entries: HashMap<u64, CacheEntry<V>>,
    /// Insertion order, oldest at the front
    order: VecDeque<u64>,
    stats: CacheStats,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity,
            entries: HashMap::new(),
            order: VecDeque::new(),
            stats: CacheStats::default(),
        }
    }

    pub fn get(&mut self, key: u64) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&mut self, key: u64, now: Instant) -> Option<V> {
        let expired = match self.entries.get(&key) {
            None => {
                self.stats.misses += 1;
                return None;
            }
            Some(entry) => now.saturating_duration_since(entry.inserted_at) >= self.ttl,
        };

        if expired {
            self.remove(key);
            self.stats.expirations += 1;
            self.stats.misses += 1;
            return None;
        }

        self.stats.hits += 1;
        self.entries.get(&key).map(|e| e.value.clone())
    }

    pub fn insert(&mut self, key: u64, value: V) {
        self.insert_at(key, value, Instant::now());
    }

    /// Re-inserting an existing key refreshes its insertion time.
    pub fn insert_at(&mut self, key: u64, value: V, now: Instant) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.contains_key(&key) {
            self.order.retain(|k| *k != key);
        }
        self.entries.insert(key, CacheEntry { value, inserted_at: now });
        self.order.push_back(key);

        while self.entries.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else { break };
            if self.entries.remove(&oldest).is_some() {
                self.stats.evictions += 1;
            }
        }
    }

    pub fn remove(&mut self, key: u64) -> Option<V> {
        let entry = self.entries.remove(&key)?;
        self.order.retain(|k| *k != key);
        Some(entry.value)
    }

    /// Drops every expired entry. Returns how many went.
    pub fn purge_expired(&mut self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    pub fn purge_expired_at(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries
            .retain(|_, e| now.saturating_duration_since(e.inserted_at) < ttl);
        let entries = &self.entries;
        self.order.retain(|k| entries.contains_key(k));

        let purged = before - self.entries.len();
        self.stats.expirations += purged as u64;
        purged
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            ..self.stats
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_expires_after_ttl() {
        let mut cache = TtlCache::new(Duration::from_secs(1), 16);
        let t0 = Instant::now();
        let key = content_key(b"validate:agent-3");

        cache.insert_at(key, "ok".to_string(), t0);
        assert_eq!(cache.get_at(key, t0 + Duration::from_millis(500)), Some("ok".to_string()));
        assert_eq!(cache.get_at(key, t0 + Duration::from_secs(2)), None);
        assert!(cache.is_empty());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.expirations, 1);
    }

    #[test]
    fn reads_do_not_extend_lifetime() {
        let mut cache = TtlCache::new(Duration::from_secs(1), 16);
        let t0 = Instant::now();
        cache.insert_at(1, 10, t0);
        for ms in [200, 400, 600, 800] {
            assert_eq!(cache.get_at(1, t0 + Duration::from_millis(ms)), Some(10));
        }
        assert_eq!(cache.get_at(1, t0 + Duration::from_millis(1000)), None);
    }

    #[test]
    fn evicts_least_recently_inserted_not_least_recently_used() {
        let mut cache = TtlCache::new(Duration::from_secs(60), 2);
        let t0 = Instant::now();
        cache.insert_at(1, "a", t0);
        cache.insert_at(2, "b", t0);

        // Touch 1; an LRU would now evict 2
        assert_eq!(cache.get_at(1, t0), Some("a"));
        cache.insert_at(3, "c", t0);

        assert_eq!(cache.get_at(1, t0), None);
        assert_eq!(cache.get_at(2, t0), Some("b"));
        assert_eq!(cache.get_at(3, t0), Some("c"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn reinsert_refreshes_position() {
        let mut cache = TtlCache::new(Duration::from_secs(60), 2);
        let t0 = Instant::now();
        cache.insert_at(1, "a", t0);
        cache.insert_at(2, "b", t0);
        cache.insert_at(1, "a2", t0);
        cache.insert_at(3, "c", t0);

        assert_eq!(cache.get_at(2, t0), None);
        assert_eq!(cache.get_at(1, t0), Some("a2"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn purge_drops_only_expired() {
        let mut cache = TtlCache::new(Duration::from_secs(1), 8);
        let t0 = Instant::now();
        cache.insert_at(1, (), t0);
        cache.insert_at(2, (), t0 + Duration::from_millis(1500));

        assert_eq!(cache.purge_expired_at(t0 + Duration::from_secs(2)), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get_at(2, t0 + Duration::from_secs(2)), Some(()));
    }

    #[test]
    fn zero_capacity_stores_nothing() {
        let mut cache = TtlCache::new(Duration::from_secs(1), 0);
        cache.insert(1, 1);
        assert!(cache.is_empty());
        assert_eq!(cache.get(1), None);
    }

    #[test]
    fn content_key_is_stable() {
        assert_eq!(content_key(b"abc"), content_key(b"abc"));
        assert_ne!(content_key(b"abc"), content_key(b"abd"));
    }
}
