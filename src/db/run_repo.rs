use async_trait::async_trait;
use mirror_core::{
    AuditLog, DeletionRecord, PersistError, RunScope, RunStatus, RunTrigger, SessionId, SyncRun,
    TenantToken,
};
use sqlx::SqlitePool;

use super::{parse_timestamp, persist_error};

/// Run log and deletion audit trail backed by SQLite.
pub struct SqliteAuditLog {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct RunRow {
    session_id: String,
    tenant: String,
    trigger: String,
    scope: String,
    status: String,
    started_at: String,
    ended_at: Option<String>,
    items_processed: i64,
    items_failed: i64,
    error_summary: String,
}

impl RunRow {
    fn into_run(self) -> Result<SyncRun, PersistError> {
        let error_summary = serde_json::from_str(&self.error_summary).map_err(|e| {
            PersistError::new(format!(
                "run {} has an unreadable error summary: {}",
                self.session_id, e
            ))
        })?;

        Ok(SyncRun {
            trigger: self.trigger.parse::<RunTrigger>().map_err(PersistError::new)?,
            scope: self.scope.parse::<RunScope>().map_err(PersistError::new)?,
            status: self.status.parse::<RunStatus>().map_err(PersistError::new)?,
            started_at: parse_timestamp(&self.started_at)?,
            ended_at: self.ended_at.as_deref().map(parse_timestamp).transpose()?,
            items_processed: self.items_processed.max(0) as u64,
            items_failed: self.items_failed.max(0) as u64,
            error_summary,
            session_id: SessionId::new(self.session_id),
            tenant: TenantToken::new(self.tenant),
        })
    }
}

impl SqliteAuditLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditLog for SqliteAuditLog {
    async fn record(&self, run: &SyncRun) -> Result<(), PersistError> {
        let error_summary =
            serde_json::to_string(&run.error_summary).unwrap_or_else(|_| "[]".to_string());

        // Finalized rows are immutable: the update only applies to started runs.
        let result = sqlx::query(
            r#"
            INSERT INTO sync_runs (session_id, tenant, trigger, scope, status, started_at, ended_at, items_processed, items_failed, error_summary)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET
                status = excluded.status,
                ended_at = excluded.ended_at,
                items_processed = excluded.items_processed,
                items_failed = excluded.items_failed,
                error_summary = excluded.error_summary
            WHERE sync_runs.status = 'started'
            "#,
        )
        .bind(run.session_id.as_str())
        .bind(run.tenant.as_str())
        .bind(run.trigger.as_str())
        .bind(run.scope.as_str())
        .bind(run.status.as_str())
        .bind(run.started_at.to_rfc3339())
        .bind(run.ended_at.map(|t| t.to_rfc3339()))
        .bind(run.items_processed as i64)
        .bind(run.items_failed as i64)
        .bind(&error_summary)
        .execute(&self.pool)
        .await
        .map_err(persist_error)?;

        if result.rows_affected() == 0 {
            return Err(PersistError::new(format!(
                "run {} is already finalized",
                run.session_id
            )));
        }
        Ok(())
    }

    async fn record_deletion(&self, record: &DeletionRecord) -> Result<(), PersistError> {
        sqlx::query(
            r#"
            INSERT INTO deletion_audit (kind, external_id, local_id, session_id, deleted_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.kind.as_str())
        .bind(&record.external_id)
        .bind(record.local_id.0)
        .bind(record.session_id.as_str())
        .bind(record.deleted_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(persist_error)?;
        Ok(())
    }

    async fn recent_runs(
        &self,
        tenant: &TenantToken,
        limit: usize,
    ) -> Result<Vec<SyncRun>, PersistError> {
        let rows: Vec<RunRow> = sqlx::query_as(
            r#"
            SELECT session_id, tenant, trigger, scope, status, started_at, ended_at, items_processed, items_failed, error_summary
            FROM sync_runs
            WHERE tenant = ?
            ORDER BY started_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(tenant.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(persist_error)?;

        rows.into_iter().map(RunRow::into_run).collect()
    }

    async fn find_run(&self, session_id: &SessionId) -> Result<Option<SyncRun>, PersistError> {
        let row: Option<RunRow> = sqlx::query_as(
            r#"
            SELECT session_id, tenant, trigger, scope, status, started_at, ended_at, items_processed, items_failed, error_summary
            FROM sync_runs
            WHERE session_id = ?
            "#,
        )
        .bind(session_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(persist_error)?;

        row.map(RunRow::into_run).transpose()
    }
}
