//! Result Cache
//!
//! Content-addressed, TTL-bound store of completed results. The key is
//! `sha256(normalized input)` joined with the task kind and the requested
//! backend/model, so re-dispatching the same request inside the TTL never
//! reaches a backend.
//!
//! Lookups are synchronous and in-memory. Expired entries are ignored on
//! lookup and overwritten by the next `put`; nothing sweeps them. The cache
//! can be saved to and loaded from a [`KeyValueStore`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::clock::SharedClock;
use crate::error::StoreError;
use crate::store::{self, namespaces, KeyValueStore};

/// Cache settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    /// Whether results are cached at all
    pub enabled: bool,
    /// Default time-to-live
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Cache key: `<sha256 hex of normalized input>_<task>_<target>`
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// Build a key from the request parts
    ///
    /// `target` is the requested backend/model, or `auto` when routing
    /// picked one.
    #[must_use]
    pub fn new(input: &str, task: &str, target: &str) -> Self {
        let digest = Sha256::digest(normalize_input(input).as_bytes());
        Self(format!(
            "{}_{}_{}",
            hex::encode(digest),
            task.trim().to_lowercase(),
            target.trim().to_lowercase()
        ))
    }

    /// Key as a string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Trim and collapse internal whitespace
#[must_use]
pub fn normalize_input(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// The cached part of a completion
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedCompletion {
    /// Generated text
    pub text: String,
    /// Backend that produced it
    pub backend: String,
    /// Model that produced it
    pub model: String,
    /// Tokens consumed when it was produced
    pub tokens: u64,
}

/// One cache entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Entry key
    pub key: CacheKey,
    /// Cached value
    pub value: CachedCompletion,
    /// When the entry was written
    pub created_at: DateTime<Utc>,
    /// When the entry stops being served
    pub expires_at: DateTime<Utc>,
    /// Times the entry was served
    pub hit_count: u64,
    /// Last time the entry was served
    pub last_accessed: Option<DateTime<Utc>>,
}

impl CacheEntry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Cache counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Stored entries, including expired ones
    pub entries: usize,
    /// Lookups that returned a value
    pub hits: u64,
    /// Lookups that returned nothing
    pub misses: u64,
}

/// In-memory result cache
#[derive(Debug)]
pub struct ResultCache {
    config: CacheConfig,
    clock: SharedClock,
    entries: DashMap<CacheKey, CacheEntry>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResultCache {
    /// Create an empty cache
    #[must_use]
    pub fn new(config: CacheConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Whether caching is enabled
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Default TTL
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        self.config.ttl
    }

    /// Look up a live entry
    ///
    /// A hit bumps the hit counter and last-access time but never extends
    /// expiry.
    pub fn get(&self, key: &CacheKey) -> Option<CachedCompletion> {
        if !self.config.enabled {
            return None;
        }
        let now = self.clock.now();
        let hit = self.entries.get_mut(key).and_then(|mut entry| {
            if entry.is_live(now) {
                entry.hit_count += 1;
                entry.last_accessed = Some(now);
                Some(entry.value.clone())
            } else {
                None
            }
        });

        if hit.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        hit
    }

    /// Store a value; `None` uses the default TTL
    ///
    /// Concurrent writers to one key race; the last write wins.
    pub fn put(&self, key: CacheKey, value: CachedCompletion, ttl: Option<Duration>) {
        if !self.config.enabled {
            return;
        }
        let now = self.clock.now();
        let ttl = chrono::Duration::from_std(ttl.unwrap_or(self.config.ttl))
            .unwrap_or(chrono::Duration::MAX);
        let expires_at = now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);

        self.entries.insert(
            key.clone(),
            CacheEntry {
                key,
                value,
                created_at: now,
                expires_at,
                hit_count: 0,
                last_accessed: None,
            },
        );
    }

    /// Raw entry including expired ones
    #[must_use]
    pub fn entry(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    /// Counters
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Write live entries to a store, keeping their remaining TTL
    pub async fn save_to(&self, store: &dyn KeyValueStore) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let live: Vec<CacheEntry> = self
            .entries
            .iter()
            .filter(|e| e.value().is_live(now))
            .map(|e| e.value().clone())
            .collect();

        for entry in &live {
            let remaining = (entry.expires_at - now).to_std().ok();
            store::save(store, namespaces::CACHE, entry.key.as_str(), entry, remaining).await?;
        }
        Ok(live.len())
    }

    /// Load live entries from a store
    pub async fn load_from(&self, store: &dyn KeyValueStore) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let mut loaded = 0;
        for key in store.keys(namespaces::CACHE).await? {
            let Some(entry) = store::load::<CacheEntry>(store, namespaces::CACHE, &key).await?
            else {
                continue;
            };
            if entry.is_live(now) {
                self.entries.insert(entry.key.clone(), entry);
                loaded += 1;
            }
        }
        tracing::debug!(loaded, "Loaded cache entries from store");
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn completion(text: &str) -> CachedCompletion {
        CachedCompletion {
            text: text.to_string(),
            backend: "ollama".to_string(),
            model: "llama3.2:3b".to_string(),
            tokens: 12,
        }
    }

    fn cache() -> (ResultCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        (ResultCache::new(CacheConfig::default(), clock.clone()), clock)
    }

    #[test]
    fn test_key_normalizes_whitespace() {
        let a = CacheKey::new("  explain   rust\n lifetimes ", "completion", "auto");
        let b = CacheKey::new("explain rust lifetimes", "Completion", "AUTO");
        assert_eq!(a, b);
        assert!(a.as_str().ends_with("_completion_auto"));
        assert_eq!(a.as_str().len(), 64 + "_completion_auto".len());

        let other_target = CacheKey::new("explain rust lifetimes", "completion", "openai");
        assert_ne!(a, other_target);
    }

    #[test]
    fn test_get_before_and_after_ttl() {
        let (cache, clock) = cache();
        let key = CacheKey::new("hello", "completion", "auto");
        cache.put(key.clone(), completion("hi"), Some(Duration::from_secs(3600)));

        clock.advance(Duration::from_secs(3599));
        assert_eq!(cache.get(&key), Some(completion("hi")));

        clock.advance(Duration::from_secs(1));
        assert_eq!(cache.get(&key), None);
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_hit_does_not_extend_expiry() {
        let (cache, clock) = cache();
        let key = CacheKey::new("hello", "completion", "auto");
        cache.put(key.clone(), completion("hi"), Some(Duration::from_secs(10)));
        let expires = cache.entry(&key).unwrap().expires_at;

        clock.advance(Duration::from_secs(5));
        cache.get(&key);
        cache.get(&key);

        let entry = cache.entry(&key).unwrap();
        assert_eq!(entry.expires_at, expires);
        assert_eq!(entry.hit_count, 2);
        assert!(entry.last_accessed.is_some());
    }

    #[test]
    fn test_expired_entry_is_overwritten() {
        let (cache, clock) = cache();
        let key = CacheKey::new("hello", "completion", "auto");
        cache.put(key.clone(), completion("old"), Some(Duration::from_secs(1)));
        clock.advance(Duration::from_secs(2));
        assert!(cache.get(&key).is_none());
        assert_eq!(cache.stats().entries, 1);

        cache.put(key.clone(), completion("new"), None);
        assert_eq!(cache.get(&key).map(|c| c.text), Some("new".to_string()));
    }

    #[test]
    fn test_disabled_cache() {
        let clock = Arc::new(ManualClock::starting_now());
        let cache = ResultCache::new(
            CacheConfig {
                enabled: false,
                ..Default::default()
            },
            clock,
        );
        let key = CacheKey::new("hello", "completion", "auto");
        cache.put(key.clone(), completion("hi"), None);
        assert!(cache.get(&key).is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (cache, clock) = cache();
        let store = MemoryStore::new(clock.clone());
        let live = CacheKey::new("a", "completion", "auto");
        let dead = CacheKey::new("b", "completion", "auto");
        cache.put(live.clone(), completion("a"), Some(Duration::from_secs(100)));
        cache.put(dead.clone(), completion("b"), Some(Duration::from_secs(1)));
        clock.advance(Duration::from_secs(2));

        assert_eq!(cache.save_to(&store).await.unwrap(), 1);

        let restored = ResultCache::new(CacheConfig::default(), clock.clone());
        assert_eq!(restored.load_from(&store).await.unwrap(), 1);
        assert_eq!(restored.get(&live), Some(completion("a")));
        assert!(restored.get(&dead).is_none());
    }
}
