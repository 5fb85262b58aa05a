//! Templates: the persisted record of one class of near-duplicate prompts.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use time::OffsetDateTime;

use super::error::DomainError;

/// Storage-assigned template identity.
pub type TemplateId = i64;

/// Number of leading tokens a fingerprint variant sees. Not a bit width.
pub type Resolution = u32;

/// Width of every fingerprint regardless of resolution.
pub const FINGERPRINT_BITS: u32 = 64;

/// Relative change a proposed working window must exceed before it replaces the stored one.
pub const WORKING_WINDOW_HYSTERESIS: f64 = 0.15;

/// Batch size recorded when the caller does not supply one.
pub const DEFAULT_BATCH_SIZE: u32 = 32;

/// Per-resolution SimHash fingerprints of one text.
///
/// Only resolutions that were actually computed are present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Fingerprints(BTreeMap<Resolution, u64>);

impl Fingerprints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, resolution: Resolution, fingerprint: u64) {
        self.0.insert(resolution, fingerprint);
    }

    pub fn get(&self, resolution: Resolution) -> Option<u64> {
        self.0.get(&resolution).copied()
    }

    pub fn contains(&self, resolution: Resolution) -> bool {
        self.0.contains_key(&resolution)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Resolutions in ascending order.
    pub fn resolutions(&self) -> impl Iterator<Item = Resolution> + '_ {
        self.0.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Resolution, u64)> + '_ {
        self.0.iter().map(|(resolution, fingerprint)| (*resolution, *fingerprint))
    }

    /// Encode one fingerprint as the fixed-width lowercase hex stored in `fingerprint_<R>` columns.
    pub fn encode_hex(fingerprint: u64) -> String {
        format!("{fingerprint:016x}")
    }

    /// Decode a stored hex fingerprint. Accepts an optional `0x` prefix and short (unpadded) values.
    pub fn decode_hex(value: &str) -> Result<u64, DomainError> {
        let trimmed = value.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);

        if digits.is_empty() || digits.len() > 16 {
            return Err(DomainError::invalid_fingerprint(
                value,
                "expected 1 to 16 hex digits",
            ));
        }

        u64::from_str_radix(digits, 16)
            .map_err(|err| DomainError::invalid_fingerprint(value, err.to_string()))
    }
}

impl FromIterator<(Resolution, u64)> for Fingerprints {
    fn from_iter<I: IntoIterator<Item = (Resolution, u64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for Fingerprints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (resolution, fingerprint) in self.iter() {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            write!(f, "{resolution}:{fingerprint:016x}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Template {
    pub id: TemplateId,
    pub template_hash: String,
    pub fingerprints: Fingerprints,
    pub working_window: u32,
    pub optimal_batch_size: u32,
    pub observation_count: u32,
    pub avg_distance: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// The values a template learns from observations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LearnedStats {
    pub working_window: u32,
    pub optimal_batch_size: u32,
    pub observation_count: u32,
    pub avg_distance: f64,
}

impl LearnedStats {
    pub fn of(template: &Template) -> Self {
        Self {
            working_window: template.working_window,
            optimal_batch_size: template.optimal_batch_size,
            observation_count: template.observation_count,
            avg_distance: template.avg_distance,
        }
    }

    /// Fold one observed outcome in.
    ///
    /// The working window is hysteresis-gated; the batch size is replaced unconditionally.
    pub fn reinforce(self, observed_distance: u32, working_window: u32, batch_size: u32) -> Self {
        let working_window = if should_update_working_window(self.working_window, working_window) {
            working_window
        } else {
            self.working_window
        };

        Self {
            working_window,
            optimal_batch_size: batch_size,
            observation_count: self.observation_count.saturating_add(1),
            avg_distance: running_average(
                self.avg_distance,
                self.observation_count,
                f64::from(observed_distance),
            ),
        }
    }
}

impl Template {
    pub fn reinforced(
        &self,
        observed_distance: u32,
        working_window: u32,
        batch_size: u32,
    ) -> LearnedStats {
        LearnedStats::of(self).reinforce(observed_distance, working_window, batch_size)
    }
}

/// Whether `proposed` differs from `current` by more than [`WORKING_WINDOW_HYSTERESIS`].
pub fn should_update_working_window(current: u32, proposed: u32) -> bool {
    if current == 0 {
        return proposed > 0;
    }
    let change = (f64::from(proposed) - f64::from(current)).abs() / f64::from(current);
    change > WORKING_WINDOW_HYSTERESIS
}

/// `(avg * n + observed) / (n + 1)`.
pub fn running_average(avg: f64, count: u32, observed: f64) -> f64 {
    let n = f64::from(count);
    (avg * n + observed) / (n + 1.0)
}
