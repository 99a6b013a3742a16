//! Cache storage implementations.
//!
//! Both caches sit on [`TtlLruStore`]: an LRU map with a time-to-live per
//! entry, an optional aggregate byte bound and hit/miss counters that live
//! under the same lock as the entries, so `clear` never exposes a partially
//! reset state.

use std::hash::Hash;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use lru::LruCache;
use metrics::counter;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::application::render::types::Fragment;

use super::config::CacheConfig;
use super::keys::{CacheKey, ResponseKey};
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::store";

const METRIC_HIT: &str = "mathgate_cache_hit_total";
const METRIC_MISS: &str = "mathgate_cache_miss_total";
const METRIC_EVICT: &str = "mathgate_cache_evict_total";
const METRIC_EXPIRE: &str = "mathgate_cache_expire_total";

struct Stored<V> {
    value: V,
    inserted_at: Instant,
    size: usize,
}

struct StoreState<K: Hash + Eq, V> {
    entries: LruCache<K, Stored<V>>,
    bytes: usize,
    hits: u64,
    misses: u64,
}

/// Point-in-time view of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub entries: usize,
    pub bytes: usize,
    pub max_entries: usize,
    pub max_bytes: Option<usize>,
    pub hits: u64,
    pub misses: u64,
}

/// LRU store with per-entry expiry and an optional byte bound.
///
/// A zero `ttl` disables expiry.
pub struct TtlLruStore<K: Hash + Eq, V> {
    name: &'static str,
    state: RwLock<StoreState<K, V>>,
    ttl: Duration,
    max_bytes: Option<usize>,
    weigh: fn(&K, &V) -> usize,
}

impl<K, V> TtlLruStore<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new(
        name: &'static str,
        capacity: std::num::NonZeroUsize,
        ttl: Duration,
        max_bytes: Option<usize>,
        weigh: fn(&K, &V) -> usize,
    ) -> Self {
        Self {
            name,
            state: RwLock::new(StoreState {
                entries: LruCache::new(capacity),
                bytes: 0,
                hits: 0,
                misses: 0,
            }),
            ttl,
            max_bytes,
            weigh,
        }
    }

    fn is_expired(&self, inserted_at: Instant, now: Instant) -> bool {
        !self.ttl.is_zero() && now.saturating_duration_since(inserted_at) >= self.ttl
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut guard = rw_write(&self.state, SOURCE, "get");
        let state = &mut *guard;

        let lookup = state
            .entries
            .get(key)
            .map(|stored| (self.is_expired(stored.inserted_at, now), stored.value.clone()));

        match lookup {
            Some((false, value)) => {
                state.hits += 1;
                drop(guard);
                counter!(METRIC_HIT, "cache" => self.name).increment(1);
                Some(value)
            }
            Some((true, _)) => {
                if let Some(stale) = state.entries.pop(key) {
                    state.bytes = state.bytes.saturating_sub(stale.size);
                }
                state.misses += 1;
                drop(guard);
                counter!(METRIC_EXPIRE, "cache" => self.name).increment(1);
                counter!(METRIC_MISS, "cache" => self.name).increment(1);
                None
            }
            None => {
                state.misses += 1;
                drop(guard);
                counter!(METRIC_MISS, "cache" => self.name).increment(1);
                None
            }
        }
    }

    /// Insert or replace `key`. Returns `false` when the entry alone exceeds the byte bound.
    pub fn set(&self, key: K, value: V) -> bool {
        let size = (self.weigh)(&key, &value);
        if self.max_bytes.is_some_and(|max| size > max) {
            debug!(cache = self.name, size, "entry exceeds byte bound, not stored");
            return false;
        }

        let mut guard = rw_write(&self.state, SOURCE, "set");
        let state = &mut *guard;

        if let Some(previous) = state.entries.pop(&key) {
            state.bytes = state.bytes.saturating_sub(previous.size);
        }

        let mut evicted = 0u64;
        while state.entries.len() >= state.entries.cap().get()
            || self
                .max_bytes
                .is_some_and(|max| state.bytes.saturating_add(size) > max)
        {
            match state.entries.pop_lru() {
                Some((_, old)) => {
                    state.bytes = state.bytes.saturating_sub(old.size);
                    evicted += 1;
                }
                None => break,
            }
        }

        state.entries.put(
            key,
            Stored {
                value,
                inserted_at: Instant::now(),
                size,
            },
        );
        state.bytes = state.bytes.saturating_add(size);
        drop(guard);

        if evicted > 0 {
            counter!(METRIC_EVICT, "cache" => self.name).increment(evicted);
        }
        true
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        if self.ttl.is_zero() {
            return 0;
        }
        let now = Instant::now();
        let mut guard = rw_write(&self.state, SOURCE, "purge_expired");
        let state = &mut *guard;

        let expired: Vec<K> = state
            .entries
            .iter()
            .filter(|(_, stored)| self.is_expired(stored.inserted_at, now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            if let Some(stale) = state.entries.pop(key) {
                state.bytes = state.bytes.saturating_sub(stale.size);
            }
        }
        drop(guard);

        if !expired.is_empty() {
            counter!(METRIC_EXPIRE, "cache" => self.name).increment(expired.len() as u64);
        }
        expired.len()
    }

    /// Remove every entry and reset the hit/miss counters.
    pub fn clear(&self) {
        let mut state = rw_write(&self.state, SOURCE, "clear");
        state.entries.clear();
        state.bytes = 0;
        state.hits = 0;
        state.misses = 0;
    }

    pub fn len(&self) -> usize {
        rw_read(&self.state, SOURCE, "len").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> StoreStats {
        let state = rw_read(&self.state, SOURCE, "stats");
        StoreStats {
            entries: state.entries.len(),
            bytes: state.bytes,
            max_entries: state.entries.cap().get(),
            max_bytes: self.max_bytes,
            hits: state.hits,
            misses: state.misses,
        }
    }
}

// ============================================================================
// Artifact cache
// ============================================================================

/// Engine output for one formula. Immutable once inserted.
#[derive(Debug)]
pub struct ArtifactCacheEntry {
    pub fragments: Vec<Fragment>,
    pub fragment_count: usize,
}

impl ArtifactCacheEntry {
    pub fn new(fragments: Vec<Fragment>) -> Self {
        let fragment_count = fragments.len();
        Self {
            fragments,
            fragment_count,
        }
    }
}

/// Computed-artifact cache: rendered fragments and MathML conversions.
pub struct ArtifactCache {
    enabled: bool,
    fragments: TtlLruStore<CacheKey, Arc<ArtifactCacheEntry>>,
    mathml: TtlLruStore<CacheKey, Arc<str>>,
}

impl ArtifactCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            enabled: config.enable_artifact_cache,
            fragments: TtlLruStore::new(
                "artifact",
                config.artifact_limit_non_zero(),
                config.artifact_ttl(),
                None,
                |key, entry| {
                    key.as_str().len()
                        + entry
                            .fragments
                            .iter()
                            .map(|fragment| fragment.svg.len())
                            .sum::<usize>()
                },
            ),
            mathml: TtlLruStore::new(
                "mathml",
                config.artifact_limit_non_zero(),
                config.artifact_ttl(),
                None,
                |key, mathml| key.as_str().len() + mathml.len(),
            ),
        }
    }

    pub fn get_fragments(&self, key: &CacheKey) -> Option<Arc<ArtifactCacheEntry>> {
        if !self.enabled {
            return None;
        }
        self.fragments.get(key)
    }

    pub fn set_fragments(&self, key: CacheKey, entry: Arc<ArtifactCacheEntry>) {
        if self.enabled {
            self.fragments.set(key, entry);
        }
    }

    pub fn get_mathml(&self, key: &CacheKey) -> Option<Arc<str>> {
        if !self.enabled {
            return None;
        }
        self.mathml.get(key)
    }

    pub fn set_mathml(&self, key: CacheKey, mathml: Arc<str>) {
        if self.enabled {
            self.mathml.set(key, mathml);
        }
    }

    pub fn purge_expired(&self) -> usize {
        self.fragments.purge_expired() + self.mathml.purge_expired()
    }

    pub fn clear(&self) {
        self.fragments.clear();
        self.mathml.clear();
    }

    pub fn len(&self) -> usize {
        self.fragments.len() + self.mathml.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn fragment_stats(&self) -> StoreStats {
        self.fragments.stats()
    }
}

// ============================================================================
// Response cache
// ============================================================================

/// Cached HTTP response: body plus the selected headers.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl CachedResponse {
    /// Body length plus serialized header length (`name: value\r\n`).
    pub fn size(&self) -> usize {
        self.body.len()
            + self
                .headers
                .iter()
                .map(|(name, value)| name.len() + value.len() + 4)
                .sum::<usize>()
    }
}

/// Response cache keyed by request path and query.
pub struct ResponseCache {
    enabled: bool,
    store: TtlLruStore<ResponseKey, CachedResponse>,
}

impl ResponseCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            enabled: config.enable_response_cache,
            store: TtlLruStore::new(
                "response",
                config.response_limit_non_zero(),
                config.response_ttl(),
                Some(config.response_max_bytes),
                |_, response| response.size(),
            ),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn get(&self, key: &ResponseKey) -> Option<CachedResponse> {
        self.store.get(key)
    }

    pub fn set(&self, key: ResponseKey, response: CachedResponse) -> bool {
        self.store.set(key, response)
    }

    pub fn purge_expired(&self) -> usize {
        self.store.purge_expired()
    }

    pub fn clear(&self) {
        self.store.clear();
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn stats(&self) -> StoreStats {
        self.store.stats()
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use super::*;

    fn store(capacity: usize, ttl_secs: u64, max_bytes: Option<usize>) -> TtlLruStore<String, String> {
        TtlLruStore::new(
            "test",
            NonZeroUsize::new(capacity).expect("non-zero"),
            Duration::from_secs(ttl_secs),
            max_bytes,
            |key, value| key.len() + value.len(),
        )
    }

    fn response(body: &str) -> CachedResponse {
        CachedResponse {
            status: 200,
            headers: vec![("content-type".to_string(), "image/svg+xml".to_string())],
            body: Bytes::from(body.to_string()),
        }
    }

    #[test]
    fn counters_track_gets() {
        let store = store(4, 0, None);
        assert!(store.get(&"a".to_string()).is_none());
        store.set("a".to_string(), "1".to_string());
        assert_eq!(store.get(&"a".to_string()).as_deref(), Some("1"));
        let stats = store.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
    }

    #[test]
    fn clear_resets_entries_and_counters() {
        let store = store(4, 0, None);
        store.set("a".to_string(), "1".to_string());
        let _ = store.get(&"a".to_string());
        let _ = store.get(&"b".to_string());
        store.clear();
        let stats = store.stats();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.bytes, 0);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn entry_count_bound_evicts_least_recent() {
        let store = store(2, 0, None);
        store.set("a".to_string(), "1".to_string());
        store.set("b".to_string(), "2".to_string());
        let _ = store.get(&"a".to_string());
        store.set("c".to_string(), "3".to_string());
        assert!(store.get(&"b".to_string()).is_none());
        assert!(store.get(&"a".to_string()).is_some());
        assert!(store.get(&"c".to_string()).is_some());
    }

    #[test]
    fn byte_bound_evicts_until_entry_fits() {
        let store = store(10, 0, Some(10));
        store.set("a".to_string(), "1234".to_string());
        store.set("b".to_string(), "1234".to_string());
        assert_eq!(store.stats().bytes, 10);
        store.set("c".to_string(), "12".to_string());
        let stats = store.stats();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.bytes, 8);
        assert!(store.get(&"a".to_string()).is_none());
    }

    #[test]
    fn oversized_entry_is_not_stored() {
        let store = store(10, 0, Some(4));
        assert!(!store.set("key".to_string(), "value".to_string()));
        assert!(store.is_empty());
    }

    #[test]
    fn replacing_key_updates_size() {
        let store = store(10, 0, None);
        store.set("a".to_string(), "1234".to_string());
        store.set("a".to_string(), "1".to_string());
        let stats = store.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.bytes, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let store = store(4, 10, None);
        store.set("a".to_string(), "1".to_string());
        store.set("b".to_string(), "2".to_string());
        tokio::time::advance(Duration::from_secs(5)).await;
        store.set("b".to_string(), "3".to_string());
        assert!(store.get(&"a".to_string()).is_some());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(store.get(&"a".to_string()).is_none());
        assert_eq!(store.purge_expired(), 0);
        assert_eq!(store.get(&"b".to_string()).as_deref(), Some("3"));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(store.purge_expired(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn response_size_counts_headers() {
        let cached = response("abc");
        assert_eq!(cached.size(), 3 + "content-type".len() + "image/svg+xml".len() + 4);
    }

    #[test]
    fn response_cache_honours_byte_bound() {
        let config = CacheConfig {
            response_max_bytes: 64,
            ..Default::default()
        };
        let cache = ResponseCache::new(&config);
        assert!(cache.set(ResponseKey::new("/render", Some("tex=a")), response("small")));
        assert!(!cache.set(
            ResponseKey::new("/render", Some("tex=b")),
            response(&"x".repeat(100))
        ));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn disabled_artifact_cache_stores_nothing() {
        let config = CacheConfig {
            enable_artifact_cache: false,
            ..Default::default()
        };
        let cache = ArtifactCache::new(&config);
        let input = crate::domain::formula::FormulaInput::new(
            crate::domain::formula::InputType::Tex,
            "x",
            10,
        )
        .expect("valid input");
        let key = CacheKey::mathml(&input);
        cache.set_mathml(key.clone(), Arc::from("<math/>"));
        assert!(cache.get_mathml(&key).is_none());
        assert!(cache.is_empty());
    }
}
