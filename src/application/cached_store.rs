//! Read-through query cache in front of any [`TemplateStore`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::cache::{CachedQuery, EngineCaches, QueryKey};
use crate::domain::{Resolution, Template, TemplateId};

use super::repos::{RepoError, SaveTemplateParams, TemplateStore, UpdateTemplateParams};

/// Upper bound on how long a candidate listing is reused.
const LISTING_TTL: Duration = Duration::from_secs(60);

/// Serves lookups from the `query` cache and forwards writes to the inner store.
///
/// Only hits are cached. A successful write through this handle drops every cached
/// query, so the next match scans what was just written. Writes made through other
/// handles show up once entries age out, after at most [`LISTING_TTL`] for listings.
pub struct CachedTemplateStore {
    inner: Arc<dyn TemplateStore>,
    caches: Arc<EngineCaches>,
}

impl CachedTemplateStore {
    pub fn new(inner: Arc<dyn TemplateStore>, caches: Arc<EngineCaches>) -> Self {
        Self { inner, caches }
    }

    pub fn inner(&self) -> &Arc<dyn TemplateStore> {
        &self.inner
    }

    fn listing_ttl(&self) -> Duration {
        self.caches.queries().default_ttl().min(LISTING_TTL)
    }

    fn forget_queries(&self, op: &'static str) {
        self.caches.queries().clear();
        debug!(op, cache = "query", "Dropped cached queries after write");
    }

    fn cached_template(&self, key: &QueryKey) -> Option<Template> {
        match self.caches.queries().get(key)? {
            CachedQuery::Template(template) => Some(template),
            CachedQuery::Templates(_) => None,
        }
    }
}

#[async_trait]
impl TemplateStore for CachedTemplateStore {
    fn backend(&self) -> &'static str {
        self.inner.backend()
    }

    fn resolutions(&self) -> &[Resolution] {
        self.inner.resolutions()
    }

    async fn save_template(&self, params: SaveTemplateParams) -> Result<TemplateId, RepoError> {
        let id = self.inner.save_template(params).await?;
        self.forget_queries("save_template");
        Ok(id)
    }

    async fn find_by_hash(&self, template_hash: &str) -> Result<Option<Template>, RepoError> {
        let key = QueryKey::ByHash(template_hash.to_string());
        if let Some(template) = self.cached_template(&key) {
            return Ok(Some(template));
        }

        let found = self.inner.find_by_hash(template_hash).await?;
        if let Some(template) = found.as_ref() {
            self.caches
                .queries()
                .put(key, CachedQuery::Template(template.clone()));
        }
        Ok(found)
    }

    async fn find_by_fingerprint(
        &self,
        resolution: Resolution,
        fingerprint: u64,
        threshold: u32,
    ) -> Result<Option<Template>, RepoError> {
        let key = QueryKey::ByFingerprint {
            resolution,
            fingerprint,
            threshold,
        };
        if let Some(template) = self.cached_template(&key) {
            return Ok(Some(template));
        }

        let found = self
            .inner
            .find_by_fingerprint(resolution, fingerprint, threshold)
            .await?;
        if let Some(template) = found.as_ref() {
            self.caches
                .queries()
                .put(key, CachedQuery::Template(template.clone()));
        }
        Ok(found)
    }

    async fn update_template(&self, params: UpdateTemplateParams) -> Result<bool, RepoError> {
        let updated = self.inner.update_template(params).await?;
        if updated {
            self.forget_queries("update_template");
        }
        Ok(updated)
    }

    async fn batch_save_templates(
        &self,
        params: Vec<SaveTemplateParams>,
    ) -> Result<Vec<TemplateId>, RepoError> {
        let ids = self.inner.batch_save_templates(params).await?;
        if !ids.is_empty() {
            self.forget_queries("batch_save_templates");
        }
        Ok(ids)
    }

    async fn batch_update_templates(
        &self,
        params: Vec<UpdateTemplateParams>,
    ) -> Result<usize, RepoError> {
        let updated = self.inner.batch_update_templates(params).await?;
        if updated > 0 {
            self.forget_queries("batch_update_templates");
        }
        Ok(updated)
    }

    async fn get_all_with_fingerprints(&self) -> Result<Vec<Template>, RepoError> {
        if let Some(CachedQuery::Templates(templates)) =
            self.caches.queries().get(&QueryKey::AllWithFingerprints)
        {
            return Ok(templates.as_ref().clone());
        }

        let templates = self.inner.get_all_with_fingerprints().await?;
        if !templates.is_empty() {
            debug!(count = templates.len(), "Caching candidate listing");
            self.caches.queries().put_with_ttl(
                QueryKey::AllWithFingerprints,
                CachedQuery::Templates(Arc::new(templates.clone())),
                self.listing_ttl(),
            );
        }
        Ok(templates)
    }

    async fn maintain(&self) -> Result<(), RepoError> {
        self.inner.maintain().await
    }

    async fn close(&self) {
        self.caches.queries().clear();
        self.inner.close().await;
    }
}
