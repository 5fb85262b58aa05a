//! The set of caches one engine instance owns.

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::domain::{Fingerprints, TextDigest};
use crate::fingerprint::ComplexityReport;
use crate::matching::MatchResult;

use super::config::CacheConfig;
use super::keys::{CachedQuery, QueryKey, ShingleKey};
use super::store::{CacheStats, TtlLruCache};

/// Cache specializations sharing one [`TtlLruCache`] implementation.
pub struct EngineCaches {
    shingles: TtlLruCache<ShingleKey, Arc<Vec<String>>>,
    fingerprints: TtlLruCache<TextDigest, Fingerprints>,
    matches: TtlLruCache<TextDigest, MatchResult>,
    queries: TtlLruCache<QueryKey, CachedQuery>,
    complexity: TtlLruCache<TextDigest, ComplexityReport>,
}

/// Stats of every cache plus the hit rate across all of them.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatsReport {
    pub caches: Vec<CacheStats>,
    pub overall_hit_rate: f64,
}

impl CacheStatsReport {
    pub fn get(&self, name: &str) -> Option<&CacheStats> {
        self.caches.iter().find(|stats| stats.name == name)
    }
}

impl EngineCaches {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            shingles: TtlLruCache::new("tokenizer", config.tokenizer),
            fingerprints: TtlLruCache::new("fingerprint", config.fingerprint),
            matches: TtlLruCache::new("match", config.matches),
            queries: TtlLruCache::new("query", config.query),
            complexity: TtlLruCache::new("complexity", config.complexity),
        }
    }

    pub fn shingles(&self) -> &TtlLruCache<ShingleKey, Arc<Vec<String>>> {
        &self.shingles
    }

    pub fn fingerprints(&self) -> &TtlLruCache<TextDigest, Fingerprints> {
        &self.fingerprints
    }

    pub fn matches(&self) -> &TtlLruCache<TextDigest, MatchResult> {
        &self.matches
    }

    pub fn queries(&self) -> &TtlLruCache<QueryKey, CachedQuery> {
        &self.queries
    }

    pub fn complexity(&self) -> &TtlLruCache<TextDigest, ComplexityReport> {
        &self.complexity
    }

    /// Drop results that a template write may have superseded.
    ///
    /// The query cache is left to expire on its own TTL.
    pub fn invalidate_on_write(&self) {
        self.fingerprints.clear();
        self.matches.clear();
        debug!(
            caches = "fingerprint,match",
            "Invalidated caches after template write"
        );
    }

    pub fn clear_all(&self) {
        self.shingles.clear();
        self.fingerprints.clear();
        self.matches.clear();
        self.queries.clear();
        self.complexity.clear();
    }

    pub fn stats(&self) -> CacheStatsReport {
        let caches = vec![
            self.shingles.stats(),
            self.fingerprints.stats(),
            self.matches.stats(),
            self.queries.stats(),
            self.complexity.stats(),
        ];
        let hits: u64 = caches.iter().map(|stats| stats.hits).sum();
        let lookups: u64 = caches.iter().map(|stats| stats.hits + stats.misses).sum();
        let overall_hit_rate = if lookups == 0 {
            0.0
        } else {
            hits as f64 / lookups as f64
        };

        CacheStatsReport {
            caches,
            overall_hit_rate,
        }
    }
}

impl Default for EngineCaches {
    fn default() -> Self {
        Self::new(&CacheConfig::default())
    }
}
