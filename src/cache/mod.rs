//! Caching for the formula service.
//!
//! - **Artifact cache**: engine output (fragments, MathML) keyed by the
//!   normalized input and the options it depends on.
//! - **Response cache**: complete HTTP bodies keyed by path and query, with
//!   entry-count, byte-size and TTL bounds and hit/miss counters.

mod config;
mod keys;
mod lock;
mod middleware;
mod store;

pub use config::CacheConfig;
pub use keys::{ArtifactKind, CacheKey, ResponseKey, hash_text};
pub(crate) use lock::mutex_lock;
pub use middleware::{CacheState, X_CACHE, response_cache_layer};
pub use store::{
    ArtifactCache, ArtifactCacheEntry, CachedResponse, ResponseCache, StoreStats, TtlLruStore,
};
