//! Two-phase nearest-template search over multi-resolution fingerprints.

use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::domain::{Fingerprints, Resolution, Template, TemplateId};
use crate::fingerprint::simhash::{hamming_distance, score_for_distance};

pub const DEFAULT_EARLY_TERMINATION: f64 = 0.95;

/// Maximum hamming distance (out of 64 bits) accepted at each resolution.
pub const DEFAULT_THRESHOLDS: [(Resolution, u32); 5] =
    [(64, 3), (128, 4), (256, 6), (512, 8), (1024, 12)];

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("no hamming threshold configured for resolution {resolution}")]
    MissingThreshold { resolution: Resolution },
    #[error("template {template_id:?} has a corrupt fingerprint: {message}")]
    CorruptFingerprint {
        template_id: Option<TemplateId>,
        message: String,
    },
}

impl MatchError {
    pub fn corrupt(template_id: Option<TemplateId>, message: impl Into<String>) -> Self {
        Self::CorruptFingerprint {
            template_id,
            message: message.into(),
        }
    }
}

/// Per-resolution hamming thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Thresholds(BTreeMap<Resolution, u32>);

impl Thresholds {
    pub fn new(map: BTreeMap<Resolution, u32>) -> Self {
        Self(map)
    }

    pub fn get(&self, resolution: Resolution) -> Result<u32, MatchError> {
        self.0
            .get(&resolution)
            .copied()
            .ok_or(MatchError::MissingThreshold { resolution })
    }

    pub fn contains(&self, resolution: Resolution) -> bool {
        self.0.contains_key(&resolution)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Resolution, u32)> + '_ {
        self.0.iter().map(|(resolution, threshold)| (*resolution, *threshold))
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self(DEFAULT_THRESHOLDS.into_iter().collect())
    }
}

/// The best template found for a text and where it was found.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub template: Template,
    pub resolution: Resolution,
    pub hamming_distance: u32,
    pub score: f64,
}

pub struct MatchEngine {
    thresholds: Thresholds,
    early_termination: f64,
}

impl MatchEngine {
    pub fn new(thresholds: Thresholds, early_termination: f64) -> Self {
        Self {
            thresholds,
            early_termination,
        }
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Best template for `fingerprints` among `templates`, or `None`.
    ///
    /// Phase 1 keeps templates within threshold at the smallest resolution the query
    /// carries; a distance-0 hit narrows the candidates to that template alone. Phase 2
    /// scores the candidates from the largest resolution down and stops once the best
    /// score reaches the early-termination threshold.
    pub fn find_best_match(
        &self,
        fingerprints: &Fingerprints,
        templates: &[Template],
    ) -> Result<Option<MatchResult>, MatchError> {
        let Some(coarse) = fingerprints.resolutions().next() else {
            return Ok(None);
        };

        let candidates = self.coarse_candidates(fingerprints, coarse, templates)?;
        if candidates.is_empty() {
            debug!(
                resolution = coarse,
                templates = templates.len(),
                "No candidates after coarse filtering"
            );
            return Ok(None);
        }
        debug!(
            resolution = coarse,
            candidates = candidates.len(),
            "Coarse filtering kept candidates"
        );

        let mut best: Option<(&Template, Resolution, u32, f64)> = None;
        let resolutions: Vec<Resolution> = fingerprints.resolutions().collect();

        for resolution in resolutions.into_iter().rev() {
            let threshold = self.thresholds.get(resolution)?;
            let Some(query) = fingerprints.get(resolution) else {
                continue;
            };

            for template in &candidates {
                let Some(stored) = template.fingerprints.get(resolution) else {
                    continue;
                };
                let distance = hamming_distance(query, stored);
                if distance > threshold {
                    continue;
                }
                let score = score_for_distance(distance);
                if best.is_none_or(|(_, _, _, best_score)| score > best_score) {
                    best = Some((template, resolution, distance, score));
                }
            }

            let best_score = best.map_or(0.0, |(_, _, _, score)| score);
            if best_score >= self.early_termination {
                debug!(resolution, score = best_score, "Early termination");
                break;
            }
        }

        Ok(best.map(|(template, resolution, distance, score)| MatchResult {
            template: template.clone(),
            resolution,
            hamming_distance: distance,
            score,
        }))
    }

    fn coarse_candidates<'a>(
        &self,
        fingerprints: &Fingerprints,
        resolution: Resolution,
        templates: &'a [Template],
    ) -> Result<Vec<&'a Template>, MatchError> {
        let threshold = self.thresholds.get(resolution)?;
        let Some(query) = fingerprints.get(resolution) else {
            return Ok(Vec::new());
        };

        let mut candidates = Vec::new();
        for template in templates {
            let Some(stored) = template.fingerprints.get(resolution) else {
                continue;
            };
            let distance = hamming_distance(query, stored);
            if distance == 0 {
                return Ok(vec![template]);
            }
            if distance <= threshold {
                candidates.push(template);
            }
        }
        Ok(candidates)
    }
}

impl Default for MatchEngine {
    fn default() -> Self {
        Self::new(Thresholds::default(), DEFAULT_EARLY_TERMINATION)
    }
}
