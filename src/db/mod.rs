mod lock_repo;
mod mirror_repo;
mod run_repo;

pub use lock_repo::SqliteLockStore;
pub use mirror_repo::SqliteMirror;
pub use run_repo::SqliteAuditLog;

use chrono::{DateTime, Utc};
use mirror_core::PersistError;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

/// Initialize the database connection pool and run migrations
pub async fn init_db(path: &Path) -> Result<SqlitePool, sqlx::Error> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite:{}?mode=rwc", path.display());

    let options = SqliteConnectOptions::from_str(&db_url)?
        .foreign_keys(true)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    // Run migrations
    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

pub(crate) fn persist_error(e: sqlx::Error) -> PersistError {
    PersistError::new(e.to_string())
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, PersistError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| PersistError::new(format!("invalid timestamp '{}': {}", value, e)))
}
