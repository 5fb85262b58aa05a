//! Cache key definitions.

use std::sync::Arc;

use crate::domain::{Resolution, Template, TextDigest};

/// Shingle lists depend on the text and how many tokens were kept.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShingleKey {
    pub digest: TextDigest,
    pub max_tokens: usize,
}

/// Template store lookups served from the query cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryKey {
    ByHash(String),
    ByFingerprint {
        resolution: Resolution,
        fingerprint: u64,
        threshold: u32,
    },
    AllWithFingerprints,
}

/// Query cache payload.
#[derive(Debug, Clone)]
pub enum CachedQuery {
    Template(Template),
    Templates(Arc<Vec<Template>>),
}
