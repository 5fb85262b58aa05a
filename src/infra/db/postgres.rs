//! Client/server template store.
//!
//! PostgreSQL has no popcount over text, so similarity defaults to trigram overlap on the
//! hex column as a prefilter. `bit_count` mode casts both sides to `bit(64)` and compares
//! exactly (PostgreSQL 14+).

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::{debug, info};

use crate::application::repos::{
    RepoError, SaveTemplateParams, TemplateStore, UpdateTemplateParams, ensure_known_resolutions,
};
use crate::domain::{Fingerprints, LearnedStats, Resolution, Template, TemplateId};
use crate::fingerprint::hamming_distance;

use super::map_sqlx_error;
use super::schema::{
    INDEXED_RESOLUTIONS, TABLE, TemplateRow, any_fingerprint_predicate, encode_fingerprint,
    fingerprint_column, normalize_resolutions, select_columns, to_u32,
};

/// Rows pulled by the trigram prefilter before exact distances are checked.
const TRIGRAM_CANDIDATES: i64 = 32;

/// Trigram similarity a candidate needs to reach the exact distance check.
///
/// Matches pg_trgm's default `%` threshold. One flipped bit changes one hex digit and
/// leaves a similarity of about 0.6, so the floor stays well below that.
pub const TRIGRAM_PREFILTER_SIMILARITY: f64 = 0.3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostgresSimilarity {
    /// `pg_trgm` similarity on hex text. Approximate recall.
    #[default]
    Trigram,
    /// Exact hamming distance through `bit_count`.
    BitCount,
}

impl PostgresSimilarity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trigram => "trigram",
            Self::BitCount => "bit_count",
        }
    }
}

impl FromStr for PostgresSimilarity {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "trigram" => Ok(Self::Trigram),
            "bit_count" | "bitcount" => Ok(Self::BitCount),
            other => Err(format!("unknown similarity mode `{other}`")),
        }
    }
}

#[derive(Clone)]
pub struct PostgresTemplateStore {
    pool: PgPool,
    resolutions: Arc<[Resolution]>,
    similarity: PostgresSimilarity,
}

impl PostgresTemplateStore {
    pub async fn connect(
        url: &str,
        max_connections: u32,
        resolutions: &[Resolution],
        similarity: PostgresSimilarity,
    ) -> Result<Self, RepoError> {
        let resolutions: Arc<[Resolution]> = normalize_resolutions(resolutions)?.into();
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(url)
            .await
            .map_err(map_sqlx_error)?;

        let store = Self {
            pool,
            resolutions,
            similarity,
        };
        store.ensure_schema().await?;
        info!(
            max_connections,
            similarity = similarity.as_str(),
            resolutions = ?store.resolutions,
            "PostgreSQL template store ready"
        );
        Ok(store)
    }

    pub fn similarity(&self) -> PostgresSimilarity {
        self.similarity
    }

    async fn ensure_schema(&self) -> Result<(), RepoError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        // Serializes concurrent first starts.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext('contextfit_schema'))")
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        let mut statements = vec![
            "CREATE EXTENSION IF NOT EXISTS pg_trgm".to_string(),
            format!(
                "CREATE TABLE IF NOT EXISTS {TABLE} (
                    id BIGSERIAL PRIMARY KEY,
                    template_hash TEXT NOT NULL UNIQUE,
                    working_window BIGINT NOT NULL,
                    observation_count BIGINT NOT NULL DEFAULT 0,
                    avg_distance DOUBLE PRECISION NOT NULL DEFAULT 0,
                    optimal_batch_size BIGINT NOT NULL DEFAULT 32,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
                )"
            ),
        ];
        for resolution in self.resolutions.iter() {
            statements.push(format!(
                "ALTER TABLE {TABLE} ADD COLUMN IF NOT EXISTS {} TEXT",
                fingerprint_column(*resolution)
            ));
        }
        for resolution in INDEXED_RESOLUTIONS
            .iter()
            .filter(|resolution| self.resolutions.contains(resolution))
        {
            let column = fingerprint_column(*resolution);
            statements.push(format!(
                "CREATE INDEX IF NOT EXISTS idx_{TABLE}_{column} ON {TABLE} ({column})"
            ));
            statements.push(format!(
                "CREATE INDEX IF NOT EXISTS idx_{TABLE}_{column}_trgm \
                 ON {TABLE} USING gin ({column} gin_trgm_ops)"
            ));
        }
        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS idx_{TABLE}_observation_count ON {TABLE} (observation_count)"
        ));

        for statement in &statements {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
        }

        tx.commit().await.map_err(map_sqlx_error)
    }

    fn read_row(&self, row: &PgRow) -> Result<TemplateRow, sqlx::Error> {
        let mut fingerprints = Vec::with_capacity(self.resolutions.len());
        for resolution in self.resolutions.iter() {
            let value: Option<String> = row.try_get(fingerprint_column(*resolution).as_str())?;
            fingerprints.push((*resolution, value));
        }

        Ok(TemplateRow {
            id: row.try_get("id")?,
            template_hash: row.try_get("template_hash")?,
            working_window: row.try_get("working_window")?,
            observation_count: row.try_get("observation_count")?,
            avg_distance: row.try_get("avg_distance")?,
            optimal_batch_size: row.try_get("optimal_batch_size")?,
            fingerprints,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn templates_from_rows(&self, rows: Vec<PgRow>) -> Result<Vec<Template>, RepoError> {
        rows.iter()
            .map(|row| {
                self.read_row(row)
                    .map_err(map_sqlx_error)
                    .and_then(TemplateRow::into_template)
            })
            .collect()
    }

    async fn upsert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        params: &SaveTemplateParams,
    ) -> Result<TemplateId, RepoError> {
        ensure_known_resolutions(&params.fingerprints, &self.resolutions)?;

        let columns: Vec<String> = self
            .resolutions
            .iter()
            .map(|resolution| fingerprint_column(*resolution))
            .collect();
        let placeholders: Vec<String> =
            (0..columns.len()).map(|index| format!("${}", index + 4)).collect();
        let updates: Vec<String> = columns
            .iter()
            .map(|column| format!("{column} = COALESCE(EXCLUDED.{column}, {TABLE}.{column})"))
            .collect();

        let sql = format!(
            "INSERT INTO {TABLE} (template_hash, working_window, optimal_batch_size, {columns}) \
             VALUES ($1, $2, $3, {placeholders}) \
             ON CONFLICT (template_hash) DO UPDATE SET \
             working_window = EXCLUDED.working_window, \
             optimal_batch_size = EXCLUDED.optimal_batch_size, \
             {updates}, \
             updated_at = now() \
             RETURNING id",
            columns = columns.join(", "),
            placeholders = placeholders.join(", "),
            updates = updates.join(", "),
        );

        let mut query = sqlx::query_scalar::<_, i64>(&sql)
            .bind(params.template_hash.as_str())
            .bind(i64::from(params.working_window))
            .bind(i64::from(params.optimal_batch_size));
        for resolution in self.resolutions.iter() {
            query = query.bind(encode_fingerprint(&params.fingerprints, *resolution));
        }

        query.fetch_one(&mut **tx).await.map_err(map_sqlx_error)
    }

    async fn apply_update(
        tx: &mut Transaction<'_, Postgres>,
        params: &UpdateTemplateParams,
    ) -> Result<bool, RepoError> {
        let row = sqlx::query(&format!(
            "SELECT working_window, observation_count, avg_distance, optimal_batch_size \
             FROM {TABLE} WHERE id = $1 FOR UPDATE"
        ))
        .bind(params.id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(map_sqlx_error)?;

        let Some(row) = row else {
            return Ok(false);
        };

        let column = |name: &str| -> Result<u32, RepoError> {
            to_u32(row.try_get(name).map_err(map_sqlx_error)?, name)
        };
        let current = LearnedStats {
            working_window: column("working_window")?,
            observation_count: column("observation_count")?,
            avg_distance: row.try_get("avg_distance").map_err(map_sqlx_error)?,
            optimal_batch_size: column("optimal_batch_size")?,
        };
        let next = current.reinforce(
            params.observed_distance,
            params.working_window,
            params.optimal_batch_size,
        );

        sqlx::query(&format!(
            "UPDATE {TABLE} SET working_window = $1, optimal_batch_size = $2, \
             observation_count = $3, avg_distance = $4, updated_at = now() WHERE id = $5"
        ))
        .bind(i64::from(next.working_window))
        .bind(i64::from(next.optimal_batch_size))
        .bind(i64::from(next.observation_count))
        .bind(next.avg_distance)
        .bind(params.id)
        .execute(&mut **tx)
        .await
        .map_err(map_sqlx_error)?;

        Ok(true)
    }

    async fn find_exact(
        &self,
        resolution: Resolution,
        fingerprint: u64,
        threshold: u32,
    ) -> Result<Option<Template>, RepoError> {
        let column = fingerprint_column(resolution);
        let distance = format!(
            "bit_count(('x' || lpad({column}, 16, '0'))::bit(64) # ('x' || lpad($1, 16, '0'))::bit(64))"
        );
        let sql = format!(
            "SELECT {columns} FROM {TABLE} \
             WHERE {column} IS NOT NULL AND {distance} <= $2 \
             ORDER BY {distance} ASC, id ASC LIMIT 1",
            columns = select_columns(&self.resolutions),
        );

        let rows = sqlx::query(&sql)
            .bind(Fingerprints::encode_hex(fingerprint))
            .bind(i64::from(threshold))
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(self.templates_from_rows(rows)?.into_iter().next())
    }

    /// Trigram prefilter, then the closest candidate whose real distance is within
    /// `threshold`. Templates the prefilter misses are never seen.
    async fn find_trigram(
        &self,
        resolution: Resolution,
        fingerprint: u64,
        threshold: u32,
    ) -> Result<Option<Template>, RepoError> {
        let column = fingerprint_column(resolution);
        let sql = format!(
            "SELECT {columns} FROM {TABLE} \
             WHERE {column} IS NOT NULL AND similarity({column}, $1) >= $2 \
             ORDER BY similarity({column}, $1) DESC, id ASC LIMIT $3",
            columns = select_columns(&self.resolutions),
        );

        let rows = sqlx::query(&sql)
            .bind(Fingerprints::encode_hex(fingerprint))
            .bind(TRIGRAM_PREFILTER_SIMILARITY as f32)
            .bind(TRIGRAM_CANDIDATES)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        let candidates = self.templates_from_rows(rows)?;
        debug!(
            resolution,
            candidates = candidates.len(),
            "Trigram prefilter returned candidates"
        );

        Ok(candidates
            .into_iter()
            .filter_map(|template| {
                let stored = template.fingerprints.get(resolution)?;
                let distance = hamming_distance(stored, fingerprint);
                (distance <= threshold).then_some((distance, template))
            })
            .min_by_key(|(distance, template)| (*distance, template.id))
            .map(|(_, template)| template))
    }
}

#[async_trait]
impl TemplateStore for PostgresTemplateStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    fn resolutions(&self) -> &[Resolution] {
        &self.resolutions
    }

    async fn save_template(&self, params: SaveTemplateParams) -> Result<TemplateId, RepoError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let id = self.upsert(&mut tx, &params).await?;
        tx.commit().await.map_err(map_sqlx_error)?;
        debug!(template_id = id, "Saved template");
        Ok(id)
    }

    async fn find_by_hash(&self, template_hash: &str) -> Result<Option<Template>, RepoError> {
        let sql = format!(
            "SELECT {} FROM {TABLE} WHERE template_hash = $1",
            select_columns(&self.resolutions)
        );
        let rows = sqlx::query(&sql)
            .bind(template_hash)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(self.templates_from_rows(rows)?.into_iter().next())
    }

    async fn find_by_fingerprint(
        &self,
        resolution: Resolution,
        fingerprint: u64,
        threshold: u32,
    ) -> Result<Option<Template>, RepoError> {
        if !self.resolutions.contains(&resolution) {
            return Err(RepoError::invalid_input(format!(
                "no fingerprint column for resolution {resolution}"
            )));
        }
        match self.similarity {
            PostgresSimilarity::Trigram => self.find_trigram(resolution, fingerprint, threshold).await,
            PostgresSimilarity::BitCount => self.find_exact(resolution, fingerprint, threshold).await,
        }
    }

    async fn update_template(&self, params: UpdateTemplateParams) -> Result<bool, RepoError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let updated = Self::apply_update(&mut tx, &params).await?;
        tx.commit().await.map_err(map_sqlx_error)?;
        if !updated {
            debug!(template_id = params.id, "Update skipped for missing template");
        }
        Ok(updated)
    }

    async fn batch_save_templates(
        &self,
        params: Vec<SaveTemplateParams>,
    ) -> Result<Vec<TemplateId>, RepoError> {
        if params.is_empty() {
            return Ok(Vec::new());
        }
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let mut ids = Vec::with_capacity(params.len());
        for item in &params {
            ids.push(self.upsert(&mut tx, item).await?);
        }
        tx.commit().await.map_err(map_sqlx_error)?;
        debug!(count = ids.len(), "Saved template batch");
        Ok(ids)
    }

    async fn batch_update_templates(
        &self,
        params: Vec<UpdateTemplateParams>,
    ) -> Result<usize, RepoError> {
        if params.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let mut updated = 0;
        for item in &params {
            if Self::apply_update(&mut tx, item).await? {
                updated += 1;
            }
        }
        tx.commit().await.map_err(map_sqlx_error)?;
        debug!(requested = params.len(), updated, "Applied template update batch");
        Ok(updated)
    }

    async fn get_all_with_fingerprints(&self) -> Result<Vec<Template>, RepoError> {
        let sql = format!(
            "SELECT {} FROM {TABLE} WHERE {} ORDER BY id",
            select_columns(&self.resolutions),
            any_fingerprint_predicate(&self.resolutions)
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        self.templates_from_rows(rows)
    }

    async fn maintain(&self) -> Result<(), RepoError> {
        sqlx::query(&format!("ANALYZE {TABLE}"))
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        info!("PostgreSQL template store maintenance finished");
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
