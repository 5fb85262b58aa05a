//! The learning loop: match a prompt against learned templates, learn new ones, and fold
//! observed outcomes back in.

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::{CacheStatsReport, EngineCaches};
use crate::config::Settings;
use crate::domain::{DEFAULT_BATCH_SIZE, Fingerprints, TemplateId, TextDigest, text};
use crate::fingerprint::{FingerprintEngine, FingerprintOptions};
use crate::matching::{DEFAULT_EARLY_TERMINATION, MatchEngine, MatchError, MatchResult, Thresholds};

use super::error::EngineError;
use super::repos::{RepoError, SaveTemplateParams, TemplateStore, UpdateTemplateParams};

const METRIC_MATCH_TOTAL: &str = "contextfit_match_total";
const METRIC_MATCH_MS: &str = "contextfit_match_ms";

const DEFAULT_SAFETY_MARGIN: f64 = 1.2;

#[derive(Debug, Clone)]
pub struct OptimizerOptions {
    pub fingerprint: FingerprintOptions,
    pub thresholds: Thresholds,
    pub early_termination: f64,
    /// Headroom multiplied onto observed token usage.
    pub safety_margin: f64,
    pub default_batch_size: u32,
}

impl Default for OptimizerOptions {
    fn default() -> Self {
        Self {
            fingerprint: FingerprintOptions::default(),
            thresholds: Thresholds::default(),
            early_termination: DEFAULT_EARLY_TERMINATION,
            safety_margin: DEFAULT_SAFETY_MARGIN,
            default_batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl From<&Settings> for OptimizerOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            fingerprint: settings.matching.fingerprint_options(),
            thresholds: settings.matching.thresholds.clone(),
            early_termination: settings.matching.early_termination,
            safety_margin: settings.learning.safety_margin,
            default_batch_size: settings.learning.default_batch_size.get(),
        }
    }
}

/// Which branch [`TemplateOptimizer::observe`] took.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ObserveOutcome {
    Reinforced {
        template_id: TemplateId,
        distance: u32,
    },
    Learned {
        template_id: TemplateId,
    },
    Skipped,
}

pub struct TemplateOptimizer {
    store: Arc<dyn TemplateStore>,
    caches: Arc<EngineCaches>,
    fingerprints: Arc<FingerprintEngine>,
    matcher: MatchEngine,
    safety_margin: f64,
    default_batch_size: u32,
}

impl TemplateOptimizer {
    pub fn new(
        store: Arc<dyn TemplateStore>,
        caches: Arc<EngineCaches>,
        options: OptimizerOptions,
    ) -> Self {
        let OptimizerOptions {
            fingerprint,
            thresholds,
            early_termination,
            safety_margin,
            default_batch_size,
        } = options;

        Self {
            fingerprints: Arc::new(FingerprintEngine::new(fingerprint, Arc::clone(&caches))),
            matcher: MatchEngine::new(thresholds, early_termination),
            store,
            caches,
            safety_margin,
            default_batch_size,
        }
    }

    pub fn store(&self) -> &Arc<dyn TemplateStore> {
        &self.store
    }

    pub fn fingerprints(&self) -> &FingerprintEngine {
        &self.fingerprints
    }

    /// Best learned template for `text`, or `None` when nothing is close enough.
    ///
    /// Fingerprints are computed on tokio's blocking pool. The scan over learned
    /// templates runs on the calling task.
    pub async fn find_matching_template(
        &self,
        text: &str,
    ) -> Result<Option<MatchResult>, EngineError> {
        if text::is_blank(text) {
            return Ok(None);
        }

        let started = Instant::now();
        let digest = TextDigest::of(text);
        if let Some(cached) = self.caches.matches().get(&digest) {
            counter!(METRIC_MATCH_TOTAL, "outcome" => "cached").increment(1);
            debug!(template_id = cached.template.id, "Match served from cache");
            return Ok(Some(cached));
        }

        let fingerprints = self.compute_fingerprints(text).await?;
        let templates = self
            .store
            .get_all_with_fingerprints()
            .await
            .map_err(|err| match err {
                RepoError::Integrity { message } => {
                    EngineError::Matching(MatchError::corrupt(None, message))
                }
                other => EngineError::Storage(other),
            })?;

        let result = self.matcher.find_best_match(&fingerprints, &templates)?;
        histogram!(METRIC_MATCH_MS).record(started.elapsed().as_secs_f64() * 1000.0);

        match result.as_ref() {
            Some(found) => {
                counter!(METRIC_MATCH_TOTAL, "outcome" => "hit").increment(1);
                info!(
                    template_id = found.template.id,
                    resolution = found.resolution,
                    distance = found.hamming_distance,
                    score = found.score,
                    "Matched template"
                );
                self.caches.matches().put(digest, found.clone());
            }
            None => {
                counter!(METRIC_MATCH_TOTAL, "outcome" => "miss").increment(1);
                debug!(templates = templates.len(), "No matching template");
            }
        }

        Ok(result)
    }

    /// Stores `text` as a template. Blank text is not learned and yields `None`.
    pub async fn learn_template(
        &self,
        text: &str,
        working_window: u32,
        batch_size: Option<u32>,
    ) -> Result<Option<TemplateId>, EngineError> {
        if text::is_blank(text) {
            debug!("Skipping learn for blank text");
            return Ok(None);
        }

        let fingerprints = self.compute_fingerprints(text).await?;
        let params = SaveTemplateParams {
            template_hash: TextDigest::of(text).template_hash(),
            fingerprints,
            working_window,
            optimal_batch_size: batch_size.unwrap_or(self.default_batch_size),
        };
        let template_id = self.store.save_template(params).await?;
        self.caches.invalidate_on_write();

        info!(template_id, working_window, "Learned template");
        Ok(Some(template_id))
    }

    /// Folds one observation into a template. Returns `false` if it no longer exists.
    pub async fn reinforce(
        &self,
        template_id: TemplateId,
        observed_distance: u32,
        working_window: u32,
        batch_size: Option<u32>,
    ) -> Result<bool, EngineError> {
        let updated = self
            .store
            .update_template(UpdateTemplateParams {
                id: template_id,
                observed_distance,
                working_window,
                optimal_batch_size: batch_size.unwrap_or(self.default_batch_size),
            })
            .await?;

        if updated {
            self.caches.invalidate_on_write();
            info!(
                template_id,
                distance = observed_distance,
                working_window,
                "Reinforced template"
            );
        } else {
            warn!(template_id, "Reinforce target does not exist");
        }
        Ok(updated)
    }

    /// Working window for a finished request: used tokens times the safety margin.
    pub fn working_window_for(&self, prompt_tokens: u32, completion_tokens: u32) -> u32 {
        let used = u64::from(prompt_tokens) + u64::from(completion_tokens);
        let window = (used as f64 * self.safety_margin).ceil();
        if window >= f64::from(u32::MAX) {
            u32::MAX
        } else {
            window as u32
        }
    }

    /// Match `text`, then reinforce the hit or learn the text on a miss.
    pub async fn observe(
        &self,
        text: &str,
        prompt_tokens: u32,
        completion_tokens: u32,
        batch_size: Option<u32>,
    ) -> Result<ObserveOutcome, EngineError> {
        if text::is_blank(text) {
            return Ok(ObserveOutcome::Skipped);
        }

        let working_window = self.working_window_for(prompt_tokens, completion_tokens);
        if let Some(found) = self.find_matching_template(text).await? {
            let template_id = found.template.id;
            let distance = found.hamming_distance;
            if self
                .reinforce(template_id, distance, working_window, batch_size)
                .await?
            {
                return Ok(ObserveOutcome::Reinforced {
                    template_id,
                    distance,
                });
            }
        }

        match self
            .learn_template(text, working_window, batch_size)
            .await?
        {
            Some(template_id) => Ok(ObserveOutcome::Learned { template_id }),
            None => Ok(ObserveOutcome::Skipped),
        }
    }

    /// Fingerprints `text` on the blocking pool so async callers keep their worker free.
    async fn compute_fingerprints(&self, text: &str) -> Result<Fingerprints, EngineError> {
        let engine = Arc::clone(&self.fingerprints);
        let text = text.to_owned();
        tokio::task::spawn_blocking(move || engine.compute_fingerprints(&text))
            .await
            .map_err(|err| EngineError::Worker {
                message: err.to_string(),
            })
    }

    pub fn cache_stats(&self) -> CacheStatsReport {
        self.caches.stats()
    }
}

#[cfg(test)]
mod tests {
    use crate::infra::db::SqliteTemplateStore;

    use super::*;

    async fn optimizer(safety_margin: f64) -> (tempfile::TempDir, TemplateOptimizer) {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = SqliteTemplateStore::open(
            &dir.path().join("optimizer.db"),
            2,
            &FingerprintOptions::default().resolutions,
        )
        .await
        .expect("store");
        let options = OptimizerOptions {
            safety_margin,
            ..OptimizerOptions::default()
        };
        let optimizer = TemplateOptimizer::new(
            Arc::new(store),
            Arc::new(EngineCaches::default()),
            options,
        );
        (dir, optimizer)
    }

    #[tokio::test]
    async fn working_window_applies_margin_and_rounds_up() {
        let (_dir, optimizer) = optimizer(1.2).await;
        assert_eq!(optimizer.working_window_for(1000, 0), 1200);
        assert_eq!(optimizer.working_window_for(1, 0), 2);
        assert_eq!(optimizer.working_window_for(0, 0), 0);
        assert_eq!(optimizer.working_window_for(u32::MAX, u32::MAX), u32::MAX);
    }

    #[tokio::test]
    async fn blank_text_is_skipped() {
        let (_dir, optimizer) = optimizer(1.2).await;
        assert!(optimizer.find_matching_template("  ").await.expect("match").is_none());
        assert_eq!(optimizer.learn_template("", 10, None).await.expect("learn"), None);
        assert_eq!(
            optimizer.observe("\n", 10, 10, None).await.expect("observe"),
            ObserveOutcome::Skipped
        );
    }

    #[tokio::test]
    async fn reinforcing_a_missing_template_reports_false() {
        let (_dir, optimizer) = optimizer(1.2).await;
        assert!(!optimizer.reinforce(999, 1, 100, None).await.expect("reinforce"));
    }

    #[tokio::test]
    async fn blocking_pool_fingerprints_match_direct_computation() {
        let (_dir, optimizer) = optimizer(1.2).await;
        let text = "the quick brown fox jumps over the lazy dog ".repeat(40);

        let offloaded = optimizer.compute_fingerprints(&text).await.expect("fingerprints");
        assert!(!offloaded.is_empty());
        assert_eq!(offloaded, optimizer.fingerprints().compute_fingerprints(&text));
    }
}
