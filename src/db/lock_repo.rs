use async_trait::async_trait;
use mirror_core::{LockError, LockRecord, LockStore};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::parse_timestamp;

/// Lock store shared by every process using the same database file.
///
/// Each compare-and-swap is a single conditional statement; the affected row
/// count decides whether the swap happened.
pub struct SqliteLockStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct LockRow {
    token: String,
    acquired_at: String,
    ttl_secs: i64,
}

fn store_error(e: impl std::fmt::Display) -> LockError {
    LockError::Store(e.to_string())
}

impl SqliteLockStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockStore for SqliteLockStore {
    async fn load(&self, key: &str) -> Result<Option<LockRecord>, LockError> {
        let row: Option<LockRow> = sqlx::query_as(
            "SELECT token, acquired_at, ttl_secs FROM sync_locks WHERE lock_key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        row.map(|row| {
            Ok(LockRecord {
                token: Uuid::parse_str(&row.token).map_err(store_error)?,
                acquired_at: parse_timestamp(&row.acquired_at).map_err(store_error)?,
                ttl_secs: row.ttl_secs.max(0) as u64,
            })
        })
        .transpose()
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&LockRecord>,
        new: Option<&LockRecord>,
    ) -> Result<bool, LockError> {
        let result = match (expected, new) {
            (None, None) => return Ok(self.load(key).await?.is_none()),
            (None, Some(new)) => {
                sqlx::query(
                    r#"
                    INSERT INTO sync_locks (lock_key, token, acquired_at, ttl_secs)
                    VALUES (?, ?, ?, ?)
                    ON CONFLICT(lock_key) DO NOTHING
                    "#,
                )
                .bind(key)
                .bind(new.token.to_string())
                .bind(new.acquired_at.to_rfc3339())
                .bind(i64::try_from(new.ttl_secs).unwrap_or(i64::MAX))
                .execute(&self.pool)
                .await
            }
            (Some(expected), Some(new)) => {
                sqlx::query(
                    r#"
                    UPDATE sync_locks SET token = ?, acquired_at = ?, ttl_secs = ?
                    WHERE lock_key = ? AND token = ?
                    "#,
                )
                .bind(new.token.to_string())
                .bind(new.acquired_at.to_rfc3339())
                .bind(i64::try_from(new.ttl_secs).unwrap_or(i64::MAX))
                .bind(key)
                .bind(expected.token.to_string())
                .execute(&self.pool)
                .await
            }
            (Some(expected), None) => {
                sqlx::query("DELETE FROM sync_locks WHERE lock_key = ? AND token = ?")
                    .bind(key)
                    .bind(expected.token.to_string())
                    .execute(&self.pool)
                    .await
            }
        }
        .map_err(store_error)?;

        Ok(result.rows_affected() == 1)
    }
}
