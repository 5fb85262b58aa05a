//! Template store backends.

mod postgres;
mod schema;
mod sqlite;
mod util;

pub use postgres::{PostgresSimilarity, PostgresTemplateStore, TRIGRAM_PREFILTER_SIMILARITY};
pub use sqlite::SqliteTemplateStore;
pub use util::{map_sqlite_error, map_sqlx_error};

use std::sync::Arc;

use tracing::info;

use crate::application::repos::{RepoError, TemplateStore};
use crate::config::{StorageBackend, StorageSettings};
use crate::domain::Resolution;

/// Opens the configured backend and ensures its schema exists.
pub async fn open_store(
    settings: &StorageSettings,
    resolutions: &[Resolution],
) -> Result<Arc<dyn TemplateStore>, RepoError> {
    let store: Arc<dyn TemplateStore> = match settings.backend {
        StorageBackend::Sqlite => Arc::new(
            SqliteTemplateStore::open(
                &settings.sqlite_path,
                settings.pool_size.get() as usize,
                resolutions,
            )
            .await?,
        ),
        StorageBackend::Postgres => {
            let url = settings.postgres_url.as_deref().ok_or_else(|| {
                RepoError::invalid_input("storage.postgres_url is required for postgres")
            })?;
            Arc::new(
                PostgresTemplateStore::connect(
                    url,
                    settings.pool_size.get(),
                    resolutions,
                    settings.postgres_similarity,
                )
                .await?,
            )
        }
    };

    info!(backend = store.backend(), "Template store opened");
    Ok(store)
}
