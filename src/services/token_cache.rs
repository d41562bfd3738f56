//! Time-bounded caches for portal sessions, channel tokens and resolved URLs
//!
//! Entries older than the cache TTL are never returned; a stale hit is
//! evicted on the spot and the caller goes back to the upstream.

use lru::LruCache;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::Config;

/// Bounded LRU cache whose entries expire `ttl` after insertion
pub struct TtlCache<K: Hash + Eq, V: Clone> {
    entries: Mutex<LruCache<K, (Instant, V)>>,
    ttl: Duration,
}

impl<K: Hash + Eq + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<K, (Instant, V)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Fresh value for `key`; expired entries are removed and reported as misses
    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.lock();
        let expired = match entries.peek(key) {
            Some((created, _)) => created.elapsed() >= self.ttl,
            None => return None,
        };
        if expired {
            entries.pop(key);
            return None;
        }
        entries.get(key).map(|(_, value)| value.clone())
    }

    pub fn insert(&self, key: K, value: V) {
        self.lock().put(key, (Instant::now(), value));
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.lock().pop(key).map(|(_, value)| value)
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.lock();
        let stale: Vec<K> = entries
            .iter()
            .filter(|(_, (created, _))| created.elapsed() >= self.ttl)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            entries.pop(key);
        }
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Portal session for one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalSession {
    pub api_path: String,
    pub token: Option<String>,
    pub secret: Option<String>,
}

/// Per-channel streaming credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelToken {
    pub secret: Option<String>,
    pub url: String,
}

/// The three caches the gateway and sync engine share
pub struct SessionCaches {
    /// Keyed by upper-case device MAC
    pub sessions: TtlCache<String, PortalSession>,
    /// Keyed by [`channel_key`]
    pub tokens: TtlCache<String, ChannelToken>,
    /// Resolved upstream URL keyed by [`channel_key`]
    pub urls: TtlCache<String, String>,
}

impl SessionCaches {
    pub fn new(config: &Config) -> Self {
        Self {
            sessions: TtlCache::new(
                config.cache_capacity,
                Duration::from_secs(config.session_ttl_secs),
            ),
            tokens: TtlCache::new(
                config.cache_capacity,
                Duration::from_secs(config.session_ttl_secs),
            ),
            urls: TtlCache::new(
                config.cache_capacity,
                Duration::from_secs(config.url_cache_ttl_secs),
            ),
        }
    }

    pub fn purge_expired(&self) -> usize {
        self.sessions.purge_expired() + self.tokens.purge_expired() + self.urls.purge_expired()
    }
}

/// Cache key for per-channel entries
pub fn channel_key(device: &str, channel_id: &str) -> String {
    format!("{}:{}", device.to_uppercase(), channel_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let cache: TtlCache<String, String> = TtlCache::new(10, Duration::from_secs(300));
        cache.insert("k".to_string(), "v".to_string());

        tokio::time::advance(Duration::from_secs(299)).await;
        assert_eq!(cache.get(&"k".to_string()), Some("v".to_string()));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get(&"k".to_string()), None);
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reinsert_refreshes_age() {
        let cache: TtlCache<&str, u32> = TtlCache::new(10, Duration::from_secs(10));
        cache.insert("k", 1);
        tokio::time::advance(Duration::from_secs(8)).await;
        cache.insert("k", 2);
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(cache.get(&"k"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let cache: TtlCache<u32, u32> = TtlCache::new(10, Duration::from_secs(60));
        cache.insert(1, 1);
        tokio::time::advance(Duration::from_secs(30)).await;
        cache.insert(2, 2);
        tokio::time::advance(Duration::from_secs(31)).await;

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&2), Some(2));
    }

    #[tokio::test]
    async fn test_capacity_bound_evicts_lru() {
        let cache: TtlCache<u32, u32> = TtlCache::new(2, Duration::from_secs(60));
        cache.insert(1, 1);
        cache.insert(2, 2);
        cache.get(&1);
        cache.insert(3, 3);

        assert_eq!(cache.get(&2), None);
        assert_eq!(cache.get(&1), Some(1));
        assert_eq!(cache.remove(&3), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_caches_ttls() {
        let config = Config::default();
        let caches = SessionCaches::new(&config);
        let key = channel_key("00:1a:79:00:00:01", "42");
        caches.urls.insert(key.clone(), "http://cdn/42.ts".to_string());
        caches.tokens.insert(
            key.clone(),
            ChannelToken {
                secret: Some("s".to_string()),
                url: "http://cdn/42.ts".to_string(),
            },
        );

        assert_eq!(caches.urls.ttl(), Duration::from_secs(config.url_cache_ttl_secs));
        assert_eq!(caches.tokens.ttl(), Duration::from_secs(config.session_ttl_secs));
        tokio::time::advance(Duration::from_secs(config.url_cache_ttl_secs)).await;
        assert_eq!(caches.urls.get(&key), None);
        assert!(caches.tokens.get(&key).is_some());
        assert_eq!(key, "00:1A:79:00:00:01:42");
    }
}
