mod config_cmd;
mod orphans;
mod status;
mod sync_cmd;

pub use config_cmd::ConfigCommand;
pub use orphans::OrphansCommand;
pub use status::StatusCommand;
pub use sync_cmd::SyncCommand;

use clap::ValueEnum;
use mirror_core::{Orchestrator, SyncOptions};
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::config::Config;
use crate::db::{SqliteAuditLog, SqliteLockStore, SqliteMirror};
use crate::source::{HttpSource, HttpSourceError};

#[derive(Debug, Clone, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// SQLite-backed stores sharing one pool.
pub struct Stores {
    pub mirror: Arc<SqliteMirror>,
    pub audit: Arc<SqliteAuditLog>,
    pub locks: Arc<SqliteLockStore>,
}

impl Stores {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            mirror: Arc::new(SqliteMirror::new(pool.clone())),
            audit: Arc::new(SqliteAuditLog::new(pool.clone())),
            locks: Arc::new(SqliteLockStore::new(pool)),
        }
    }

    /// Wires the stores to the configured catalog API.
    pub fn orchestrator(
        &self,
        config: &Config,
        options: SyncOptions,
    ) -> Result<Orchestrator, HttpSourceError> {
        let source = HttpSource::from_config(&config.source)?;
        Ok(Orchestrator::new(
            Arc::new(source),
            self.mirror.clone(),
            self.audit.clone(),
            self.locks.clone(),
            options,
        ))
    }
}
