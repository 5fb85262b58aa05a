//! Content digests of prompt text.

use std::fmt;

use sha2::{Digest, Sha256};

/// Hex characters of the digest kept as a template's `template_hash`.
const TEMPLATE_HASH_LEN: usize = 16;

/// SHA-256 digest of raw prompt text, hex encoded.
///
/// Used both as the cache key for per-text results and as the source of `template_hash`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextDigest(String);

impl TextDigest {
    pub fn of(text: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        Self(hex::encode(hasher.finalize().to_vec()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short content hash identifying the template a text originates.
    pub fn template_hash(&self) -> String {
        self.0[..TEMPLATE_HASH_LEN].to_string()
    }
}

impl fmt::Display for TextDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// True when `text` has nothing to fingerprint.
pub fn is_blank(text: &str) -> bool {
    text.trim().is_empty()
}
