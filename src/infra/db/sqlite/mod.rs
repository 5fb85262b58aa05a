//! Embedded single-file template store.
//!
//! Fingerprint similarity runs inside the query engine through the registered
//! `hamming_distance` scalar function, so only matching rows are materialized.

mod functions;
mod pool;

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::types::{Type, Value};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params, params_from_iter};
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::application::repos::{
    RepoError, SaveTemplateParams, TemplateStore, UpdateTemplateParams, ensure_known_resolutions,
};
use crate::domain::{Fingerprints, LearnedStats, Resolution, Template, TemplateId};

use super::schema::{
    INDEXED_RESOLUTIONS, TABLE, TemplateRow, any_fingerprint_predicate, encode_fingerprint,
    fingerprint_column, normalize_resolutions, select_columns, to_u32,
};
use super::util::map_sqlite_error;

use pool::ConnectionPool;

pub struct SqliteTemplateStore {
    pool: ConnectionPool,
    resolutions: Arc<[Resolution]>,
}

impl SqliteTemplateStore {
    /// Opens (creating if needed) the database file and brings its schema up to date.
    pub async fn open(
        path: &Path,
        pool_size: usize,
        resolutions: &[Resolution],
    ) -> Result<Self, RepoError> {
        let resolutions: Arc<[Resolution]> = normalize_resolutions(resolutions)?.into();
        let pool = ConnectionPool::open(path, pool_size)?;
        let store = Self { pool, resolutions };
        store.ensure_schema().await?;
        info!(
            path = %path.display(),
            pool_size,
            resolutions = ?store.resolutions,
            "Embedded template store ready"
        );
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), RepoError> {
        let resolutions = Arc::clone(&self.resolutions);
        self.pool
            .run(move |conn| ensure_schema(conn, &resolutions))
            .await
    }
}

fn ensure_schema(conn: &mut Connection, resolutions: &[Resolution]) -> Result<(), RepoError> {
    let fingerprint_columns: String = resolutions
        .iter()
        .map(|resolution| format!("    {} TEXT,\n", fingerprint_column(*resolution)))
        .collect();

    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(map_sqlite_error)?;

    tx.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {TABLE} (\n\
         \x20   id INTEGER PRIMARY KEY AUTOINCREMENT,\n\
         \x20   template_hash TEXT NOT NULL UNIQUE,\n\
         \x20   working_window INTEGER NOT NULL,\n\
         \x20   observation_count INTEGER NOT NULL DEFAULT 0,\n\
         \x20   avg_distance REAL NOT NULL DEFAULT 0.0,\n\
         \x20   optimal_batch_size INTEGER NOT NULL DEFAULT 32,\n\
         {fingerprint_columns}\
         \x20   created_at INTEGER NOT NULL,\n\
         \x20   updated_at INTEGER NOT NULL\n\
         );"
    ))
    .map_err(map_sqlite_error)?;

    let existing: HashSet<String> = {
        let mut stmt = tx
            .prepare(&format!("PRAGMA table_info({TABLE})"))
            .map_err(map_sqlite_error)?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>("name"))
            .map_err(map_sqlite_error)?
            .collect::<Result<HashSet<_>, _>>()
            .map_err(map_sqlite_error)?;
        names
    };

    for resolution in resolutions {
        let column = fingerprint_column(*resolution);
        if !existing.contains(&column) {
            tx.execute_batch(&format!("ALTER TABLE {TABLE} ADD COLUMN {column} TEXT;"))
                .map_err(map_sqlite_error)?;
            info!(column = %column, "Added fingerprint column");
        }
    }

    for resolution in INDEXED_RESOLUTIONS
        .iter()
        .filter(|resolution| resolutions.contains(resolution))
    {
        let column = fingerprint_column(*resolution);
        tx.execute_batch(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{TABLE}_{column} ON {TABLE} ({column});"
        ))
        .map_err(map_sqlite_error)?;
    }
    tx.execute_batch(&format!(
        "CREATE INDEX IF NOT EXISTS idx_{TABLE}_observation_count ON {TABLE} (observation_count);"
    ))
    .map_err(map_sqlite_error)?;

    tx.commit().map_err(map_sqlite_error)
}

fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

fn millis_to_datetime(index: usize, millis: i64) -> rusqlite::Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(index, Type::Integer, Box::new(err)))
}

fn read_row(row: &Row<'_>, resolutions: &[Resolution]) -> rusqlite::Result<TemplateRow> {
    let mut fingerprints = Vec::with_capacity(resolutions.len());
    for resolution in resolutions {
        let value: Option<String> = row.get(fingerprint_column(*resolution).as_str())?;
        fingerprints.push((*resolution, value));
    }
    let timestamps_at = 6 + resolutions.len();

    Ok(TemplateRow {
        id: row.get("id")?,
        template_hash: row.get("template_hash")?,
        working_window: row.get("working_window")?,
        observation_count: row.get("observation_count")?,
        avg_distance: row.get("avg_distance")?,
        optimal_batch_size: row.get("optimal_batch_size")?,
        fingerprints,
        created_at: millis_to_datetime(timestamps_at, row.get("created_at")?)?,
        updated_at: millis_to_datetime(timestamps_at + 1, row.get("updated_at")?)?,
    })
}

fn query_templates(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
    resolutions: &[Resolution],
) -> Result<Vec<Template>, RepoError> {
    let mut stmt = conn.prepare_cached(sql).map_err(map_sqlite_error)?;
    let rows = stmt
        .query_map(params, |row| read_row(row, resolutions))
        .map_err(map_sqlite_error)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(map_sqlite_error)?;
    rows.into_iter().map(TemplateRow::into_template).collect()
}

fn upsert(
    conn: &Connection,
    resolutions: &[Resolution],
    params: &SaveTemplateParams,
    now: i64,
) -> Result<TemplateId, RepoError> {
    ensure_known_resolutions(&params.fingerprints, resolutions)?;

    let columns: Vec<String> = resolutions.iter().map(|r| fingerprint_column(*r)).collect();
    let fingerprint_placeholders: Vec<String> =
        (0..columns.len()).map(|index| format!("?{}", index + 5)).collect();
    let fingerprint_updates: Vec<String> = columns
        .iter()
        .map(|column| format!("{column} = COALESCE(excluded.{column}, {TABLE}.{column})"))
        .collect();

    let sql = format!(
        "INSERT INTO {TABLE} (template_hash, working_window, optimal_batch_size, \
         observation_count, avg_distance, created_at, updated_at, {columns}) \
         VALUES (?1, ?2, ?3, 0, 0.0, ?4, ?4, {placeholders}) \
         ON CONFLICT(template_hash) DO UPDATE SET \
         working_window = excluded.working_window, \
         optimal_batch_size = excluded.optimal_batch_size, \
         {updates}, \
         updated_at = excluded.updated_at \
         RETURNING id",
        columns = columns.join(", "),
        placeholders = fingerprint_placeholders.join(", "),
        updates = fingerprint_updates.join(", "),
    );

    let mut values: Vec<Value> = vec![
        Value::Text(params.template_hash.clone()),
        Value::Integer(i64::from(params.working_window)),
        Value::Integer(i64::from(params.optimal_batch_size)),
        Value::Integer(now),
    ];
    values.extend(resolutions.iter().map(|resolution| {
        encode_fingerprint(&params.fingerprints, *resolution).map_or(Value::Null, Value::Text)
    }));

    conn.prepare_cached(&sql)
        .and_then(|mut stmt| stmt.query_row(params_from_iter(values), |row| row.get(0)))
        .map_err(map_sqlite_error)
}

fn apply_update(conn: &Connection, params: &UpdateTemplateParams, now: i64) -> Result<bool, RepoError> {
    let current = conn
        .query_row(
            &format!(
                "SELECT working_window, observation_count, avg_distance, optimal_batch_size \
                 FROM {TABLE} WHERE id = ?1"
            ),
            params![params.id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        )
        .optional()
        .map_err(map_sqlite_error)?;

    let Some((working_window, observation_count, avg_distance, optimal_batch_size)) = current else {
        return Ok(false);
    };

    let next = LearnedStats {
        working_window: to_u32(working_window, "working_window")?,
        observation_count: to_u32(observation_count, "observation_count")?,
        avg_distance,
        optimal_batch_size: to_u32(optimal_batch_size, "optimal_batch_size")?,
    }
    .reinforce(
        params.observed_distance,
        params.working_window,
        params.optimal_batch_size,
    );

    conn.execute(
        &format!(
            "UPDATE {TABLE} SET working_window = ?1, optimal_batch_size = ?2, \
             observation_count = ?3, avg_distance = ?4, updated_at = ?5 WHERE id = ?6"
        ),
        params![
            next.working_window,
            next.optimal_batch_size,
            next.observation_count,
            next.avg_distance,
            now,
            params.id
        ],
    )
    .map_err(map_sqlite_error)?;

    Ok(true)
}

#[async_trait]
impl TemplateStore for SqliteTemplateStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    fn resolutions(&self) -> &[Resolution] {
        &self.resolutions
    }

    async fn save_template(&self, params: SaveTemplateParams) -> Result<TemplateId, RepoError> {
        let resolutions = Arc::clone(&self.resolutions);
        let id = self
            .pool
            .run(move |conn| {
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(map_sqlite_error)?;
                let id = upsert(&tx, &resolutions, &params, now_millis())?;
                tx.commit().map_err(map_sqlite_error)?;
                Ok(id)
            })
            .await?;
        debug!(template_id = id, "Saved template");
        Ok(id)
    }

    async fn find_by_hash(&self, template_hash: &str) -> Result<Option<Template>, RepoError> {
        let resolutions = Arc::clone(&self.resolutions);
        let template_hash = template_hash.to_string();
        self.pool
            .run(move |conn| {
                let sql = format!(
                    "SELECT {} FROM {TABLE} WHERE template_hash = ?1",
                    select_columns(&resolutions)
                );
                Ok(query_templates(conn, &sql, params![template_hash], &resolutions)?
                    .into_iter()
                    .next())
            })
            .await
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

        let resolutions = Arc::clone(&self.resolutions);
        self.pool
            .run(move |conn| {
                let column = fingerprint_column(resolution);
                let sql = format!(
                    "SELECT {columns} FROM {TABLE} \
                     WHERE {column} IS NOT NULL AND hamming_distance({column}, ?1) <= ?2 \
                     ORDER BY hamming_distance({column}, ?1) ASC, id ASC \
                     LIMIT 1",
                    columns = select_columns(&resolutions),
                );
                let hex = Fingerprints::encode_hex(fingerprint);
                Ok(query_templates(conn, &sql, params![hex, threshold], &resolutions)?
                    .into_iter()
                    .next())
            })
            .await
    }

    async fn update_template(&self, params: UpdateTemplateParams) -> Result<bool, RepoError> {
        let template_id = params.id;
        let updated = self
            .pool
            .run(move |conn| {
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(map_sqlite_error)?;
                let updated = apply_update(&tx, &params, now_millis())?;
                tx.commit().map_err(map_sqlite_error)?;
                Ok(updated)
            })
            .await?;
        if !updated {
            debug!(template_id, "Update skipped for missing template");
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
        let resolutions = Arc::clone(&self.resolutions);
        let ids = self
            .pool
            .run(move |conn| {
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(map_sqlite_error)?;
                let now = now_millis();
                let mut ids = Vec::with_capacity(params.len());
                for item in &params {
                    ids.push(upsert(&tx, &resolutions, item, now)?);
                }
                tx.commit().map_err(map_sqlite_error)?;
                Ok(ids)
            })
            .await?;
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
        let requested = params.len();
        let updated = self
            .pool
            .run(move |conn| {
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(map_sqlite_error)?;
                let now = now_millis();
                let mut updated = 0;
                for item in &params {
                    if apply_update(&tx, item, now)? {
                        updated += 1;
                    }
                }
                tx.commit().map_err(map_sqlite_error)?;
                Ok(updated)
            })
            .await?;
        debug!(requested, updated, "Applied template update batch");
        Ok(updated)
    }

    async fn get_all_with_fingerprints(&self) -> Result<Vec<Template>, RepoError> {
        let resolutions = Arc::clone(&self.resolutions);
        self.pool
            .run(move |conn| {
                let sql = format!(
                    "SELECT {} FROM {TABLE} WHERE {} ORDER BY id",
                    select_columns(&resolutions),
                    any_fingerprint_predicate(&resolutions)
                );
                query_templates(conn, &sql, [], &resolutions)
            })
            .await
    }

    async fn maintain(&self) -> Result<(), RepoError> {
        self.pool
            .run(|conn| {
                conn.execute_batch("PRAGMA optimize; VACUUM;")
                    .map_err(map_sqlite_error)
            })
            .await?;
        info!("Embedded template store maintenance finished");
        Ok(())
    }

    async fn close(&self) {
        self.pool.close();
    }
}
