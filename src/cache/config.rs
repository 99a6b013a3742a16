//! Cache configuration.
//!
//! Bounds for the artifact cache (engine output) and the response cache
//! (complete HTTP bodies), read from the `[cache]` settings section.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

const DEFAULT_ARTIFACT_LIMIT: usize = 512;
const DEFAULT_ARTIFACT_TTL_SECONDS: u64 = 3600;
const DEFAULT_RESPONSE_LIMIT: usize = 1000;
const DEFAULT_RESPONSE_MAX_BYTES: usize = 64 * 1024 * 1024;
const DEFAULT_RESPONSE_TTL_SECONDS: u64 = 3600;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Enable the artifact cache.
    pub enable_artifact_cache: bool,
    /// Maximum entries in the artifact cache.
    pub artifact_limit: usize,
    /// Seconds an artifact stays valid after insertion.
    pub artifact_ttl_seconds: u64,
    /// Enable the response cache.
    pub enable_response_cache: bool,
    /// Maximum responses held.
    pub response_limit: usize,
    /// Maximum aggregate size of held responses (body + headers).
    pub response_max_bytes: usize,
    /// Seconds a response stays valid after insertion.
    pub response_ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enable_artifact_cache: true,
            artifact_limit: DEFAULT_ARTIFACT_LIMIT,
            artifact_ttl_seconds: DEFAULT_ARTIFACT_TTL_SECONDS,
            enable_response_cache: true,
            response_limit: DEFAULT_RESPONSE_LIMIT,
            response_max_bytes: DEFAULT_RESPONSE_MAX_BYTES,
            response_ttl_seconds: DEFAULT_RESPONSE_TTL_SECONDS,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enable_artifact_cache: settings.enable_artifact_cache,
            artifact_limit: settings.artifact_limit,
            artifact_ttl_seconds: settings.artifact_ttl_seconds,
            enable_response_cache: settings.enable_response_cache,
            response_limit: settings.response_limit,
            response_max_bytes: settings.response_max_bytes,
            response_ttl_seconds: settings.response_ttl_seconds,
        }
    }
}

impl CacheConfig {
    /// Returns the artifact limit as NonZeroUsize, clamping to 1 if zero.
    pub fn artifact_limit_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.artifact_limit).unwrap_or(NonZeroUsize::MIN)
    }

    /// Returns the response limit as NonZeroUsize, clamping to 1 if zero.
    pub fn response_limit_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.response_limit).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn artifact_ttl(&self) -> Duration {
        Duration::from_secs(self.artifact_ttl_seconds)
    }

    pub fn response_ttl(&self) -> Duration {
        Duration::from_secs(self.response_ttl_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert!(config.enable_artifact_cache);
        assert!(config.enable_response_cache);
        assert_eq!(config.artifact_limit, 512);
        assert_eq!(config.response_limit, 1000);
        assert_eq!(config.response_max_bytes, 64 * 1024 * 1024);
        assert_eq!(config.response_ttl(), Duration::from_secs(3600));
    }

    #[test]
    fn non_zero_clamps_to_min() {
        let config = CacheConfig {
            artifact_limit: 0,
            response_limit: 0,
            ..Default::default()
        };
        assert_eq!(config.artifact_limit_non_zero().get(), 1);
        assert_eq!(config.response_limit_non_zero().get(), 1);
    }
}
