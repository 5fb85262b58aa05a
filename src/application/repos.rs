//! Repository traits describing persistence adapters.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{Fingerprints, Resolution, Template, TemplateId};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("duplicate record violates unique constraint `{constraint}`")]
    Duplicate { constraint: String },
    #[error("resource not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("integrity error: {message}")]
    Integrity { message: String },
    #[error("database timeout")]
    Timeout,
    #[error("template store is closed")]
    Closed,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity {
            message: message.into(),
        }
    }
}

/// Insert-or-overwrite of one template keyed by `template_hash`.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveTemplateParams {
    pub template_hash: String,
    /// Resolutions absent here keep whatever the stored row already has.
    pub fingerprints: Fingerprints,
    pub working_window: u32,
    pub optimal_batch_size: u32,
}

/// One observed outcome to fold into an existing template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateTemplateParams {
    pub id: TemplateId,
    pub observed_distance: u32,
    pub working_window: u32,
    pub optimal_batch_size: u32,
}

/// Persistence port for learned templates.
///
/// Every call is one logical transaction; batch calls run in a single transaction and
/// either fully apply or roll back.
#[async_trait]
pub trait TemplateStore: Send + Sync {
    /// Short backend name for logs.
    fn backend(&self) -> &'static str;

    /// Resolutions this store has `fingerprint_<R>` columns for.
    fn resolutions(&self) -> &[Resolution];

    /// Upsert by hash. A concurrent insert of the same hash resolves to an update.
    async fn save_template(&self, params: SaveTemplateParams) -> Result<TemplateId, RepoError>;

    async fn find_by_hash(&self, template_hash: &str) -> Result<Option<Template>, RepoError>;

    /// A template whose fingerprint at `resolution` is within `threshold` of `fingerprint`.
    async fn find_by_fingerprint(
        &self,
        resolution: Resolution,
        fingerprint: u64,
        threshold: u32,
    ) -> Result<Option<Template>, RepoError>;

    /// Applies the running average and working-window hysteresis. Returns `false` without
    /// writing when the template does not exist.
    async fn update_template(&self, params: UpdateTemplateParams) -> Result<bool, RepoError>;

    /// Ids in input order. All-or-nothing.
    async fn batch_save_templates(
        &self,
        params: Vec<SaveTemplateParams>,
    ) -> Result<Vec<TemplateId>, RepoError>;

    /// Updates that target missing ids are skipped. Returns how many templates changed.
    async fn batch_update_templates(
        &self,
        params: Vec<UpdateTemplateParams>,
    ) -> Result<usize, RepoError>;

    /// Templates with at least one fingerprint set.
    async fn get_all_with_fingerprints(&self) -> Result<Vec<Template>, RepoError>;

    /// Refresh planner statistics and reclaim space.
    async fn maintain(&self) -> Result<(), RepoError>;

    /// Release pooled connections. Later calls fail with [`RepoError::Closed`].
    async fn close(&self);
}

/// Rejects fingerprints at resolutions the store has no column for.
pub fn ensure_known_resolutions(
    fingerprints: &Fingerprints,
    known: &[Resolution],
) -> Result<(), RepoError> {
    match fingerprints
        .resolutions()
        .find(|resolution| !known.contains(resolution))
    {
        Some(resolution) => Err(RepoError::invalid_input(format!(
            "no fingerprint column for resolution {resolution}"
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_resolution_is_invalid_input() {
        let fingerprints: Fingerprints = [(64, 1), (96, 2)].into_iter().collect();
        let err = ensure_known_resolutions(&fingerprints, &[64, 128]).unwrap_err();
        assert!(matches!(err, RepoError::InvalidInput { .. }));
        assert!(ensure_known_resolutions(&fingerprints, &[64, 96]).is_ok());
    }
}
