//! Table layout shared by every backend.
//!
//! One row per template with a nullable hex column `fingerprint_<R>` for each configured
//! resolution. Column names are derived from integers only.

use time::OffsetDateTime;

use crate::application::repos::RepoError;
use crate::domain::{Fingerprints, Resolution, Template, TemplateId};

pub(crate) const TABLE: &str = "templates";

/// Resolutions whose fingerprint columns get a plain index.
pub(crate) const INDEXED_RESOLUTIONS: [Resolution; 2] = [64, 128];

pub(crate) const BASE_COLUMNS: &str =
    "id, template_hash, working_window, observation_count, avg_distance, optimal_batch_size";

pub(crate) fn fingerprint_column(resolution: Resolution) -> String {
    format!("fingerprint_{resolution}")
}

/// Full projection: base columns, every fingerprint column, then timestamps.
pub(crate) fn select_columns(resolutions: &[Resolution]) -> String {
    let mut columns = String::from(BASE_COLUMNS);
    for resolution in resolutions {
        columns.push_str(", ");
        columns.push_str(&fingerprint_column(*resolution));
    }
    columns.push_str(", created_at, updated_at");
    columns
}

/// `(fingerprint_64 IS NOT NULL OR ...)`.
pub(crate) fn any_fingerprint_predicate(resolutions: &[Resolution]) -> String {
    let clauses: Vec<String> = resolutions
        .iter()
        .map(|resolution| format!("{} IS NOT NULL", fingerprint_column(*resolution)))
        .collect();
    format!("({})", clauses.join(" OR "))
}

/// Sorted, deduplicated, non-empty and strictly positive.
pub(crate) fn normalize_resolutions(resolutions: &[Resolution]) -> Result<Vec<Resolution>, RepoError> {
    let mut normalized = resolutions.to_vec();
    normalized.sort_unstable();
    normalized.dedup();
    if normalized.is_empty() {
        return Err(RepoError::invalid_input("at least one resolution is required"));
    }
    if normalized.contains(&0) {
        return Err(RepoError::invalid_input("resolution 0 is not valid"));
    }
    Ok(normalized)
}

pub(crate) fn encode_fingerprint(fingerprints: &Fingerprints, resolution: Resolution) -> Option<String> {
    fingerprints.get(resolution).map(Fingerprints::encode_hex)
}

/// Decodes stored hex columns. A value that is not hex is an integrity error.
pub(crate) fn decode_fingerprints<I>(id: TemplateId, columns: I) -> Result<Fingerprints, RepoError>
where
    I: IntoIterator<Item = (Resolution, Option<String>)>,
{
    let mut fingerprints = Fingerprints::new();
    for (resolution, value) in columns {
        let Some(value) = value else {
            continue;
        };
        let fingerprint = Fingerprints::decode_hex(&value).map_err(|err| {
            RepoError::integrity(format!(
                "template {id} column {}: {err}",
                fingerprint_column(resolution)
            ))
        })?;
        fingerprints.insert(resolution, fingerprint);
    }
    Ok(fingerprints)
}

/// A `templates` row before fingerprint and range validation.
pub(crate) struct TemplateRow {
    pub id: TemplateId,
    pub template_hash: String,
    pub working_window: i64,
    pub observation_count: i64,
    pub avg_distance: f64,
    pub optimal_batch_size: i64,
    pub fingerprints: Vec<(Resolution, Option<String>)>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl TemplateRow {
    pub(crate) fn into_template(self) -> Result<Template, RepoError> {
        Ok(Template {
            fingerprints: decode_fingerprints(self.id, self.fingerprints)?,
            working_window: to_u32(self.working_window, "working_window")?,
            observation_count: to_u32(self.observation_count, "observation_count")?,
            optimal_batch_size: to_u32(self.optimal_batch_size, "optimal_batch_size")?,
            avg_distance: self.avg_distance,
            id: self.id,
            template_hash: self.template_hash,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

pub(crate) fn to_u32(value: i64, column: &str) -> Result<u32, RepoError> {
    u32::try_from(value)
        .map_err(|_| RepoError::integrity(format!("column {column} holds out-of-range value {value}")))
}
