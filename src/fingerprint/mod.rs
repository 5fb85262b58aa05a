//! Multi-resolution SimHash fingerprinting.
//!
//! A resolution is how many leading tokens a fingerprint sees, never its width: every
//! fingerprint is 64 bits. Short and long near-duplicates are both caught by comparing
//! at several resolutions.

mod complexity;
pub mod simhash;

use std::sync::Arc;
use std::time::Instant;

use metrics::histogram;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, warn};

use crate::cache::{EngineCaches, ShingleKey};
use crate::domain::{FINGERPRINT_BITS, Fingerprints, Resolution, TextDigest, text};

pub use complexity::{ComplexityAnalyzer, ComplexityReport};
pub use simhash::{hamming_distance, similarity};

const METRIC_FINGERPRINT_MS: &str = "contextfit_fingerprint_ms";

pub const DEFAULT_RESOLUTIONS: [Resolution; 5] = [64, 128, 256, 512, 1024];
pub const DEFAULT_MAX_WORKERS: usize = 4;

/// Which resolutions to compute and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintOptions {
    /// Ascending, deduplicated.
    pub resolutions: Vec<Resolution>,
    /// Narrow the set per text by complexity.
    pub adaptive: bool,
    /// Worker threads for per-resolution computation; 1 computes sequentially.
    pub max_workers: usize,
}

impl Default for FingerprintOptions {
    fn default() -> Self {
        Self {
            resolutions: DEFAULT_RESOLUTIONS.to_vec(),
            adaptive: true,
            max_workers: DEFAULT_MAX_WORKERS,
        }
    }
}

pub struct FingerprintEngine {
    options: FingerprintOptions,
    caches: Arc<EngineCaches>,
    analyzer: ComplexityAnalyzer,
    pool: Option<ThreadPool>,
}

impl FingerprintEngine {
    pub fn new(options: FingerprintOptions, caches: Arc<EngineCaches>) -> Self {
        let pool = if options.max_workers > 1 {
            match ThreadPoolBuilder::new()
                .num_threads(options.max_workers)
                .thread_name(|index| format!("contextfit-fp-{index}"))
                .build()
            {
                Ok(pool) => Some(pool),
                Err(err) => {
                    warn!(
                        error = %err,
                        max_workers = options.max_workers,
                        "Fingerprint worker pool unavailable; computing sequentially"
                    );
                    None
                }
            }
        } else {
            None
        };

        Self {
            analyzer: ComplexityAnalyzer::new(Arc::clone(&caches)),
            options,
            caches,
            pool,
        }
    }

    pub fn resolutions(&self) -> &[Resolution] {
        &self.options.resolutions
    }

    pub fn analyzer(&self) -> &ComplexityAnalyzer {
        &self.analyzer
    }

    /// Shingles over the first `max_tokens` tokens, cached by text and budget.
    pub fn tokenize_and_shingle(&self, text: &str, max_tokens: usize) -> Arc<Vec<String>> {
        let key = ShingleKey {
            digest: TextDigest::of(text),
            max_tokens,
        };
        if let Some(shingles) = self.caches.shingles().get(&key) {
            return shingles;
        }

        let shingles = Arc::new(simhash::tokenize_and_shingle(text, max_tokens));
        self.caches.shingles().put(key, Arc::clone(&shingles));
        shingles
    }

    /// 64-bit SimHash of one shingle list.
    pub fn compute_fingerprint<S: AsRef<str>>(&self, shingles: &[S]) -> u64 {
        simhash::compute_fingerprint(shingles, FINGERPRINT_BITS)
    }

    /// Fingerprints of `text` at every selected resolution.
    ///
    /// Blank text yields an empty map, which callers treat as "no match possible".
    pub fn compute_fingerprints(&self, text: &str) -> Fingerprints {
        if text::is_blank(text) {
            return Fingerprints::new();
        }

        let digest = TextDigest::of(text);
        if let Some(fingerprints) = self.caches.fingerprints().get(&digest) {
            return fingerprints;
        }

        let started = Instant::now();
        let resolutions = if self.options.adaptive {
            self.analyzer
                .adaptive_resolutions(text, &self.options.resolutions)
        } else {
            self.options.resolutions.clone()
        };

        let fingerprint_at = |resolution: Resolution| {
            let shingles = self.tokenize_and_shingle(text, resolution as usize);
            (resolution, self.compute_fingerprint(&shingles))
        };

        let fingerprints: Fingerprints = match &self.pool {
            Some(pool) if resolutions.len() > 1 => pool
                .install(|| {
                    resolutions
                        .par_iter()
                        .map(|resolution| fingerprint_at(*resolution))
                        .collect::<Vec<_>>()
                })
                .into_iter()
                .collect(),
            _ => resolutions.iter().map(|r| fingerprint_at(*r)).collect(),
        };

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        histogram!(METRIC_FINGERPRINT_MS).record(elapsed_ms);
        debug!(
            resolutions = fingerprints.len(),
            elapsed_ms,
            "Computed fingerprints"
        );

        self.caches.fingerprints().put(digest, fingerprints.clone());
        fingerprints
    }
}
