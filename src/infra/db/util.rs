use rusqlite::ErrorCode;

use crate::application::repos::RepoError;

pub fn map_sqlx_error(err: sqlx::Error) -> RepoError {
    match err {
        sqlx::Error::RowNotFound => RepoError::NotFound,
        sqlx::Error::PoolTimedOut => RepoError::Timeout,
        sqlx::Error::PoolClosed => RepoError::Closed,
        sqlx::Error::Database(db) if db.message().contains("duplicate key") => {
            RepoError::Duplicate {
                constraint: db.constraint().unwrap_or("unknown").to_string(),
            }
        }
        sqlx::Error::Database(db) if db.message().contains("invalid input syntax") => {
            RepoError::InvalidInput {
                message: db.message().to_string(),
            }
        }
        sqlx::Error::Database(db) if db.message().contains("violates") => RepoError::Integrity {
            message: db.message().to_string(),
        },
        sqlx::Error::Database(db)
            if db
                .message()
                .contains("canceling statement due to user request") =>
        {
            RepoError::Timeout
        }
        other => RepoError::from_persistence(other),
    }
}

pub fn map_sqlite_error(err: rusqlite::Error) -> RepoError {
    match err {
        rusqlite::Error::QueryReturnedNoRows => RepoError::NotFound,
        rusqlite::Error::SqliteFailure(failure, message) => {
            let message = message.unwrap_or_else(|| failure.to_string());
            match failure.code {
                ErrorCode::ConstraintViolation if message.contains("UNIQUE") => {
                    RepoError::Duplicate {
                        constraint: message
                            .rsplit(": ")
                            .next()
                            .unwrap_or("unknown")
                            .to_string(),
                    }
                }
                ErrorCode::ConstraintViolation => RepoError::Integrity { message },
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => RepoError::Timeout,
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => {
                    RepoError::Integrity { message }
                }
                _ => RepoError::Persistence(message),
            }
        }
        other => RepoError::from_persistence(other),
    }
}

#[cfg(test)]
mod tests {
    use rusqlite::Connection;

    use super::*;

    #[test]
    fn unique_violation_maps_to_duplicate() {
        let conn = Connection::open_in_memory().expect("in-memory database");
        conn.execute_batch("CREATE TABLE t (k TEXT UNIQUE); INSERT INTO t VALUES ('a');")
            .expect("schema");
        let err = conn
            .execute("INSERT INTO t VALUES ('a')", [])
            .expect_err("duplicate insert should fail");

        match map_sqlite_error(err) {
            RepoError::Duplicate { constraint } => assert_eq!(constraint, "t.k"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn missing_row_maps_to_not_found() {
        assert!(matches!(
            map_sqlite_error(rusqlite::Error::QueryReturnedNoRows),
            RepoError::NotFound
        ));
        assert!(matches!(
            map_sqlx_error(sqlx::Error::RowNotFound),
            RepoError::NotFound
        ));
    }
}
