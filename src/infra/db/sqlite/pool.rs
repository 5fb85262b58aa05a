//! Bounded pool of embedded-database connections driven from async code.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::Connection;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::application::repos::RepoError;
use crate::cache::mutex_lock;
use crate::infra::db::util::map_sqlite_error;

use super::functions::register_functions;

const SOURCE: &str = "infra::db::sqlite::pool";

/// 64 MB page cache (negative values are KiB).
const CACHE_SIZE_KIB: i64 = -64_000;

/// How long a writer waits for the database lock before reporting a timeout.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// At most `size` connections exist; each call borrows one on a blocking thread.
pub(crate) struct ConnectionPool {
    path: PathBuf,
    idle: Arc<Mutex<Vec<Connection>>>,
    permits: Arc<Semaphore>,
}

impl ConnectionPool {
    /// Opens the first connection eagerly so a bad path fails at startup.
    pub(crate) fn open(path: &Path, size: usize) -> Result<Self, RepoError> {
        let size = size.max(1);
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|err| {
                RepoError::from_persistence(format!(
                    "failed to create database directory `{}`: {err}",
                    parent.display()
                ))
            })?;
        }

        let first = open_connection(path)?;
        debug!(path = %path.display(), size, "Opened embedded connection pool");

        Ok(Self {
            path: path.to_path_buf(),
            idle: Arc::new(Mutex::new(vec![first])),
            permits: Arc::new(Semaphore::new(size)),
        })
    }

    /// Runs `op` with exclusive use of one connection.
    pub(crate) async fn run<T, F>(&self, op: F) -> Result<T, RepoError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, RepoError> + Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| RepoError::Closed)?;

        let pooled = mutex_lock(&self.idle, SOURCE, "checkout").pop();
        let path = self.path.clone();
        let idle = Arc::clone(&self.idle);
        let permits = Arc::clone(&self.permits);

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let mut conn = match pooled {
                Some(conn) => conn,
                None => open_connection(&path)?,
            };
            let result = op(&mut conn);
            if !permits.is_closed() {
                mutex_lock(&idle, SOURCE, "checkin").push(conn);
            }
            result
        })
        .await
        .map_err(|err| RepoError::from_persistence(format!("blocking task failed: {err}")))?
    }

    /// Stops handing out connections and drops idle ones. Calls in flight finish first.
    pub(crate) fn close(&self) {
        self.permits.close();
        let drained: Vec<Connection> = mutex_lock(&self.idle, SOURCE, "close").drain(..).collect();
        debug!(connections = drained.len(), "Closed embedded connection pool");
    }
}

fn open_connection(path: &Path) -> Result<Connection, RepoError> {
    let conn = Connection::open(path).map_err(map_sqlite_error)?;
    conn.busy_timeout(BUSY_TIMEOUT).map_err(map_sqlite_error)?;
    let journal_mode: String = conn
        .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
        .map_err(map_sqlite_error)?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .map_err(map_sqlite_error)?;
    conn.pragma_update(None, "cache_size", CACHE_SIZE_KIB)
        .map_err(map_sqlite_error)?;
    register_functions(&conn).map_err(map_sqlite_error)?;

    debug!(journal_mode = %journal_mode, "Opened embedded connection");
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reuses_connections_and_rejects_after_close() {
        let dir = tempfile::tempdir().expect("temp dir");
        let pool = ConnectionPool::open(&dir.path().join("nested/pool.db"), 2).expect("pool");

        let mode: String = pool
            .run(|conn| {
                conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))
                    .map_err(map_sqlite_error)
            })
            .await
            .expect("query");
        assert_eq!(mode.to_lowercase(), "wal");

        let distance: i64 = pool
            .run(|conn| {
                conn.query_row("SELECT hamming_distance('ff', '0f')", [], |row| row.get(0))
                    .map_err(map_sqlite_error)
            })
            .await
            .expect("function registered");
        assert_eq!(distance, 4);

        pool.close();
        let err = pool.run(|_| Ok(())).await.unwrap_err();
        assert!(matches!(err, RepoError::Closed));
    }
}
