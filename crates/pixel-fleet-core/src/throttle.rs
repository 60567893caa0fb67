//! Bounded TTL cache and the log throttle built on it.
//!
//! There is no background cleanup: expired keys are purged lazily whenever the
//! cache is touched, so an idle cache costs nothing.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// Key → expiry map with lazy eviction and a hard size bound.
#[derive(Debug, Clone)]
pub struct TtlCache<K> {
    entries: HashMap<K, Instant>,
    capacity: usize,
}

impl<K: Eq + Hash + Clone> TtlCache<K> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn insert(&mut self, key: K, ttl: Duration) {
        self.insert_at(key, ttl, Instant::now());
    }

    /// Insert or refresh `key`, expiring `ttl` after `now`.
    ///
    /// When the cache is full after purging, the entry closest to expiry is evicted.
    pub fn insert_at(&mut self, key: K, ttl: Duration, now: Instant) {
        self.purge_expired(now);
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, expiry)| **expiry)
                .map(|(k, _)| k.clone());
            if let Some(k) = oldest {
                self.entries.remove(&k);
            }
        }
        self.entries.insert(key, now + ttl);
    }

    pub fn contains(&mut self, key: &K) -> bool {
        self.contains_at(key, Instant::now())
    }

    pub fn contains_at(&mut self, key: &K, now: Instant) -> bool {
        self.purge_expired(now);
        self.entries.contains_key(key)
    }

    /// Drop every entry whose expiry is at or before `now`. Returns how many went.
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, expiry| *expiry > now);
        before - self.entries.len()
    }

    /// Live keys as of `now`.
    pub fn live_keys(&mut self, now: Instant) -> impl Iterator<Item = &K> {
        self.purge_expired(now);
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Suppresses repeats of the same notification within a time window.
#[derive(Debug, Clone)]
pub struct LogThrottle {
    seen: TtlCache<String>,
    default_ttl: Duration,
}

impl LogThrottle {
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        Self {
            seen: TtlCache::new(capacity),
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Emit `message` as a warning unless `key` was emitted within `ttl`.
    /// Returns whether it was emitted.
    pub fn log_once(&mut self, key: &str, message: &str, ttl: Duration) -> bool {
        self.log_once_at(key, message, ttl, Instant::now())
    }

    pub fn log_once_at(&mut self, key: &str, message: &str, ttl: Duration, now: Instant) -> bool {
        if !self.should_emit_at(key, ttl, now) {
            debug!(key, "Suppressed repeated log");
            return false;
        }
        warn!(key, "{message}");
        true
    }

    /// The gate on its own, for callers that want their own log level.
    pub fn should_emit_at(&mut self, key: &str, ttl: Duration, now: Instant) -> bool {
        let key = key.to_string();
        if self.seen.contains_at(&key, now) {
            return false;
        }
        self.seen.insert_at(key, ttl, now);
        true
    }

    pub fn should_emit(&mut self, key: &str) -> bool {
        self.should_emit_at(key, self.default_ttl, Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_log_once_window() {
        let mut throttle = LogThrottle::new(16, ms(10_000));
        let t0 = Instant::now();
        assert!(throttle.log_once_at("k", "m", ms(1000), t0));
        assert!(!throttle.log_once_at("k", "m", ms(1000), t0 + ms(500)));
        assert!(throttle.log_once_at("k", "m", ms(1000), t0 + ms(1500)));
    }

    #[test]
    fn test_distinct_keys_independent() {
        let mut throttle = LogThrottle::new(16, ms(1000));
        let t0 = Instant::now();
        assert!(throttle.should_emit_at("a", ms(1000), t0));
        assert!(throttle.should_emit_at("b", ms(1000), t0));
        assert!(!throttle.should_emit_at("a", ms(1000), t0 + ms(1)));
    }

    #[test]
    fn test_lazy_purge() {
        let mut cache = TtlCache::new(8);
        let t0 = Instant::now();
        cache.insert_at(1, ms(100), t0);
        cache.insert_at(2, ms(300), t0);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.purge_expired(t0 + ms(200)), 1);
        assert!(!cache.contains_at(&1, t0 + ms(200)));
        assert!(cache.contains_at(&2, t0 + ms(200)));
        assert!(!cache.contains_at(&2, t0 + ms(300)));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_evicts_soonest_expiry() {
        let mut cache = TtlCache::new(2);
        let t0 = Instant::now();
        cache.insert_at("short", ms(10), t0);
        cache.insert_at("long", ms(1000), t0);
        cache.insert_at("new", ms(500), t0);
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains_at(&"short", t0));
        assert!(cache.contains_at(&"long", t0));
        assert!(cache.contains_at(&"new", t0));
    }

    #[test]
    fn test_refresh_existing_key_at_capacity() {
        let mut cache = TtlCache::new(1);
        let t0 = Instant::now();
        cache.insert_at("a", ms(10), t0);
        cache.insert_at("a", ms(100), t0 + ms(5));
        assert!(cache.contains_at(&"a", t0 + ms(50)));
    }
}
