//! Cache configuration.
//!
//! Every cache specialization has its own capacity and entry lifetime, set under
//! `[cache.<name>]` in `contextfit.toml`:
//!
//! ```toml
//! [cache.fingerprint]
//! max_size = 1000
//! ttl_seconds = 3600
//! ```

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

const DEFAULT_TOKENIZER_SIZE: usize = 500;
const DEFAULT_TOKENIZER_TTL_SECS: u64 = 3600;
const DEFAULT_FINGERPRINT_SIZE: usize = 1000;
const DEFAULT_FINGERPRINT_TTL_SECS: u64 = 3600;
const DEFAULT_MATCH_SIZE: usize = 512;
const DEFAULT_MATCH_TTL_SECS: u64 = 1800;
const DEFAULT_QUERY_SIZE: usize = 200;
const DEFAULT_QUERY_TTL_SECS: u64 = 60;
const DEFAULT_COMPLEXITY_SIZE: usize = 256;
const DEFAULT_COMPLEXITY_TTL_SECS: u64 = 300;

/// Longest accepted entry lifetime: one year.
pub const MAX_TTL_SECONDS: u64 = 365 * 24 * 60 * 60;

/// Capacity and lifetime of one cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct CachePolicy {
    /// Maximum live entries before the least recently used one is evicted.
    pub max_size: usize,
    /// Seconds an entry stays valid after insertion.
    pub ttl_seconds: u64,
}

impl CachePolicy {
    pub const fn new(max_size: usize, ttl_seconds: u64) -> Self {
        Self {
            max_size,
            ttl_seconds,
        }
    }

    /// Returns the capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn max_size_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_size).unwrap_or(NonZeroUsize::MIN)
    }

    /// Entry lifetime, capped at [`MAX_TTL_SECONDS`].
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds.min(MAX_TTL_SECONDS))
    }
}

/// Policies for all cache specializations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Shingle lists keyed by text and token budget.
    pub tokenizer: CachePolicy,
    /// Per-text fingerprint maps.
    pub fingerprint: CachePolicy,
    /// Best-match results per text.
    pub matches: CachePolicy,
    /// Template store query results.
    pub query: CachePolicy,
    /// Complexity reports used for adaptive resolution selection.
    pub complexity: CachePolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            tokenizer: CachePolicy::new(DEFAULT_TOKENIZER_SIZE, DEFAULT_TOKENIZER_TTL_SECS),
            fingerprint: CachePolicy::new(DEFAULT_FINGERPRINT_SIZE, DEFAULT_FINGERPRINT_TTL_SECS),
            matches: CachePolicy::new(DEFAULT_MATCH_SIZE, DEFAULT_MATCH_TTL_SECS),
            query: CachePolicy::new(DEFAULT_QUERY_SIZE, DEFAULT_QUERY_TTL_SECS),
            complexity: CachePolicy::new(DEFAULT_COMPLEXITY_SIZE, DEFAULT_COMPLEXITY_TTL_SECS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_capacity_clamps_to_one() {
        assert_eq!(CachePolicy::new(0, 10).max_size_non_zero().get(), 1);
        assert_eq!(CachePolicy::new(7, 10).max_size_non_zero().get(), 7);
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = CacheConfig::default();
        assert_eq!(config.tokenizer, CachePolicy::new(500, 3600));
        assert_eq!(config.fingerprint, CachePolicy::new(1000, 3600));
        assert_eq!(config.matches, CachePolicy::new(512, 1800));
        assert_eq!(config.query, CachePolicy::new(200, 60));
        assert_eq!(config.complexity.ttl(), Duration::from_secs(300));
    }

    #[test]
    fn oversized_ttl_is_capped() {
        assert_eq!(
            CachePolicy::new(4, u64::MAX).ttl(),
            Duration::from_secs(MAX_TTL_SECONDS)
        );
    }
}
