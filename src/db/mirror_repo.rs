use async_trait::async_trait;
use chrono::Utc;
use mirror_core::{
    EntityDraft, EntityId, Fingerprint, MediaRef, Mirror, PersistError, RecordKind, RegistryEntry,
    RegistryKey, SessionId, SyncStamp, TenantToken,
};
use sqlx::SqlitePool;

use super::{parse_timestamp, persist_error};

/// Mirror store backed by SQLite. Entity and registry rows always change in
/// the same transaction.
pub struct SqliteMirror {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct RegistryRow {
    tenant: String,
    kind: String,
    external_id: String,
    local_id: i64,
    content_fingerprint: String,
    last_synced_at: String,
    last_sync_session_id: String,
}

impl RegistryRow {
    fn into_entry(self) -> Result<RegistryEntry, PersistError> {
        Ok(RegistryEntry {
            tenant: TenantToken::new(self.tenant),
            kind: self.kind.parse::<RecordKind>().map_err(PersistError::new)?,
            external_id: self.external_id,
            local_id: EntityId(self.local_id),
            content_fingerprint: Fingerprint::from_hex(self.content_fingerprint),
            last_synced_at: parse_timestamp(&self.last_synced_at)?,
            last_sync_session_id: SessionId::new(self.last_sync_session_id),
        })
    }
}

const REGISTRY_COLUMNS: &str = "tenant, kind, external_id, local_id, content_fingerprint, last_synced_at, last_sync_session_id";

impl SqliteMirror {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Mirrored entity counts for a tenant, by kind.
    pub async fn counts_by_kind(
        &self,
        tenant: &TenantToken,
    ) -> Result<Vec<(RecordKind, i64)>, PersistError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT kind, COUNT(*) FROM registry WHERE tenant = ? GROUP BY kind ORDER BY kind",
        )
        .bind(tenant.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(persist_error)?;

        rows.into_iter()
            .map(|(kind, count)| {
                kind.parse::<RecordKind>()
                    .map(|k| (k, count))
                    .map_err(PersistError::new)
            })
            .collect()
    }
}

#[async_trait]
impl Mirror for SqliteMirror {
    async fn registry_entry(&self, key: &RegistryKey) -> Result<Option<RegistryEntry>, PersistError> {
        let row: Option<RegistryRow> = sqlx::query_as(&format!(
            "SELECT {} FROM registry WHERE tenant = ? AND kind = ? AND external_id = ?",
            REGISTRY_COLUMNS
        ))
        .bind(key.tenant.as_str())
        .bind(key.kind.as_str())
        .bind(&key.external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(persist_error)?;

        row.map(RegistryRow::into_entry).transpose()
    }

    async fn upsert_entity(
        &self,
        draft: &EntityDraft,
        terms: &[EntityId],
        stamp: &SyncStamp,
    ) -> Result<EntityId, PersistError> {
        let payload = serde_json::to_string(&draft.payload)
            .map_err(|e| PersistError::new(format!("unserializable payload: {}", e)))?;
        let now = Utc::now().to_rfc3339();

        let mut tx = self.pool.begin().await.map_err(persist_error)?;

        let local_id = match draft.local_id {
            Some(id) => {
                let result = sqlx::query(
                    r#"
                    UPDATE entities
                    SET title = ?, slug = ?, excerpt = ?, payload = ?, updated_at = ?
                    WHERE local_id = ?
                    "#,
                )
                .bind(&draft.title)
                .bind(&draft.slug)
                .bind(&draft.excerpt)
                .bind(&payload)
                .bind(&now)
                .bind(id.0)
                .execute(&mut *tx)
                .await
                .map_err(persist_error)?;

                if result.rows_affected() == 0 {
                    return Err(PersistError::new(format!("entity {} not found", id)));
                }
                id
            }
            None => {
                let result = sqlx::query(
                    r#"
                    INSERT INTO entities (tenant, kind, external_id, title, slug, excerpt, payload, created_at, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(draft.tenant.as_str())
                .bind(draft.kind.as_str())
                .bind(&draft.external_id)
                .bind(&draft.title)
                .bind(&draft.slug)
                .bind(&draft.excerpt)
                .bind(&payload)
                .bind(&now)
                .bind(&now)
                .execute(&mut *tx)
                .await
                .map_err(persist_error)?;
                EntityId(result.last_insert_rowid())
            }
        };

        // Replace taxonomy links
        sqlx::query("DELETE FROM entity_terms WHERE entity_id = ?")
            .bind(local_id.0)
            .execute(&mut *tx)
            .await
            .map_err(persist_error)?;
        for term in terms {
            sqlx::query("INSERT OR IGNORE INTO entity_terms (entity_id, term_id) VALUES (?, ?)")
                .bind(local_id.0)
                .bind(term.0)
                .execute(&mut *tx)
                .await
                .map_err(persist_error)?;
        }

        sqlx::query(
            r#"
            INSERT INTO registry (tenant, kind, external_id, local_id, content_fingerprint, last_synced_at, last_sync_session_id)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(tenant, kind, external_id) DO UPDATE SET
                local_id = excluded.local_id,
                content_fingerprint = excluded.content_fingerprint,
                last_synced_at = excluded.last_synced_at,
                last_sync_session_id = excluded.last_sync_session_id
            "#,
        )
        .bind(draft.tenant.as_str())
        .bind(draft.kind.as_str())
        .bind(&draft.external_id)
        .bind(local_id.0)
        .bind(draft.fingerprint.as_str())
        .bind(stamp.synced_at.to_rfc3339())
        .bind(stamp.session_id.as_str())
        .execute(&mut *tx)
        .await
        .map_err(persist_error)?;

        tx.commit().await.map_err(persist_error)?;
        Ok(local_id)
    }

    async fn stamp_entry(&self, key: &RegistryKey, stamp: &SyncStamp) -> Result<(), PersistError> {
        let result = sqlx::query(
            r#"
            UPDATE registry SET last_synced_at = ?, last_sync_session_id = ?
            WHERE tenant = ? AND kind = ? AND external_id = ?
            "#,
        )
        .bind(stamp.synced_at.to_rfc3339())
        .bind(stamp.session_id.as_str())
        .bind(key.tenant.as_str())
        .bind(key.kind.as_str())
        .bind(&key.external_id)
        .execute(&self.pool)
        .await
        .map_err(persist_error)?;

        if result.rows_affected() == 0 {
            return Err(PersistError::new(format!("no registry entry for {}", key)));
        }
        Ok(())
    }

    async fn delete_entity(&self, entry: &RegistryEntry) -> Result<bool, PersistError> {
        let mut tx = self.pool.begin().await.map_err(persist_error)?;

        let removed = sqlx::query(
            "DELETE FROM registry WHERE tenant = ? AND kind = ? AND external_id = ? AND local_id = ?",
        )
        .bind(entry.tenant.as_str())
        .bind(entry.kind.as_str())
        .bind(&entry.external_id)
        .bind(entry.local_id.0)
        .execute(&mut *tx)
        .await
        .map_err(persist_error)?;

        if removed.rows_affected() == 0 {
            return Ok(false);
        }

        // Terms and media cascade
        sqlx::query("DELETE FROM entities WHERE local_id = ?")
            .bind(entry.local_id.0)
            .execute(&mut *tx)
            .await
            .map_err(persist_error)?;

        tx.commit().await.map_err(persist_error)?;
        Ok(true)
    }

    async fn lookup_by_external_id(
        &self,
        tenant: &TenantToken,
        kind: RecordKind,
        external_id: &str,
    ) -> Result<Option<EntityId>, PersistError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT local_id FROM registry WHERE tenant = ? AND kind = ? AND external_id = ?",
        )
        .bind(tenant.as_str())
        .bind(kind.as_str())
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(persist_error)?;

        Ok(row.map(|(id,)| EntityId(id)))
    }

    async fn lookup_term(
        &self,
        tenant: &TenantToken,
        kind: RecordKind,
        external_id: &str,
    ) -> Result<Option<EntityId>, PersistError> {
        if !kind.is_taxonomy() {
            return Ok(None);
        }
        self.lookup_by_external_id(tenant, kind, external_id).await
    }

    async fn entries_outside_session(
        &self,
        tenant: &TenantToken,
        session_id: &SessionId,
        kind: Option<RecordKind>,
    ) -> Result<Vec<RegistryEntry>, PersistError> {
        let rows: Vec<RegistryRow> = match kind {
            Some(kind) => {
                sqlx::query_as(&format!(
                    "SELECT {} FROM registry WHERE tenant = ? AND last_sync_session_id != ? AND kind = ? ORDER BY kind, external_id",
                    REGISTRY_COLUMNS
                ))
                .bind(tenant.as_str())
                .bind(session_id.as_str())
                .bind(kind.as_str())
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as(&format!(
                    "SELECT {} FROM registry WHERE tenant = ? AND last_sync_session_id != ? ORDER BY kind, external_id",
                    REGISTRY_COLUMNS
                ))
                .bind(tenant.as_str())
                .bind(session_id.as_str())
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(persist_error)?;

        rows.into_iter().map(RegistryRow::into_entry).collect()
    }

    async fn display_name(&self, local_id: EntityId) -> Result<Option<String>, PersistError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT title FROM entities WHERE local_id = ?")
            .bind(local_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(persist_error)?;

        Ok(row.map(|(title,)| title))
    }

    async fn attach_media(&self, local_id: EntityId, media: &[MediaRef]) -> Result<(), PersistError> {
        let mut tx = self.pool.begin().await.map_err(persist_error)?;

        let exists: Option<(i64,)> = sqlx::query_as("SELECT local_id FROM entities WHERE local_id = ?")
            .bind(local_id.0)
            .fetch_optional(&mut *tx)
            .await
            .map_err(persist_error)?;
        if exists.is_none() {
            return Err(PersistError::new(format!("entity {} not found", local_id)));
        }

        sqlx::query("DELETE FROM entity_media WHERE entity_id = ?")
            .bind(local_id.0)
            .execute(&mut *tx)
            .await
            .map_err(persist_error)?;
        for (position, item) in media.iter().enumerate() {
            sqlx::query(
                "INSERT INTO entity_media (entity_id, position, url, caption) VALUES (?, ?, ?, ?)",
            )
            .bind(local_id.0)
            .bind(position as i64)
            .bind(&item.url)
            .bind(&item.caption)
            .execute(&mut *tx)
            .await
            .map_err(persist_error)?;
        }

        tx.commit().await.map_err(persist_error)?;
        Ok(())
    }

    async fn has_media(&self, local_id: EntityId) -> Result<bool, PersistError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM entity_media WHERE entity_id = ?")
                .bind(local_id.0)
                .fetch_one(&self.pool)
                .await
                .map_err(persist_error)?;
        Ok(count > 0)
    }

    async fn mark_pending(&self, key: &RegistryKey) -> Result<(), PersistError> {
        let result = sqlx::query(
            r#"
            UPDATE registry SET content_fingerprint = ?
            WHERE tenant = ? AND kind = ? AND external_id = ?
            "#,
        )
        .bind(Fingerprint::pending().as_str())
        .bind(key.tenant.as_str())
        .bind(key.kind.as_str())
        .bind(&key.external_id)
        .execute(&self.pool)
        .await
        .map_err(persist_error)?;

        if result.rows_affected() == 0 {
            return Err(PersistError::new(format!("no registry entry for {}", key)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use crate::db::SqliteAuditLog;
    use mirror_core::{
        EntityMapper, Orchestrator, ProcedureIndex, RemoteRecord, RunStatus, RunTrigger,
        SessionError, SyncError, SyncOptions,
    };
    use mirror_core::memory::{MemoryAuditLog, MemoryLockStore, MemorySource};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    async fn setup() -> (tempfile::TempDir, SqlitePool, SqliteMirror) {
        let temp_dir = tempdir().unwrap();
        let pool = init_db(&temp_dir.path().join("test.db")).await.unwrap();
        let mirror = SqliteMirror::new(pool.clone());
        (temp_dir, pool, mirror)
    }

    fn tenant() -> TenantToken {
        TenantToken::new("acme")
    }

    fn draft(kind: RecordKind, external_id: &str, payload: serde_json::Value) -> EntityDraft {
        let tenant = tenant();
        let index = ProcedureIndex::new();
        EntityMapper::new(&tenant, &index)
            .to_create(&RemoteRecord::new(kind, external_id, payload))
            .unwrap()
    }

    fn stamp(session: &str) -> SyncStamp {
        SyncStamp::new(SessionId::new(session))
    }

    #[tokio::test]
    async fn test_upsert_creates_entity_and_registry_entry() {
        let (_dir, _pool, mirror) = setup().await;
        let draft = draft(RecordKind::Category, "1", json!({"name": "Breast"}));

        let id = mirror.upsert_entity(&draft, &[], &stamp("s1")).await.unwrap();

        let key = RegistryKey::new(tenant(), RecordKind::Category, "1");
        let entry = mirror.registry_entry(&key).await.unwrap().unwrap();
        assert_eq!(entry.local_id, id);
        assert_eq!(entry.content_fingerprint, draft.fingerprint);
        assert_eq!(entry.last_sync_session_id, SessionId::new("s1"));
        assert_eq!(mirror.display_name(id).await.unwrap().as_deref(), Some("Breast"));
    }

    #[tokio::test]
    async fn test_update_overwrites_in_place() {
        let (_dir, _pool, mirror) = setup().await;
        let created = draft(RecordKind::Category, "1", json!({"name": "Breast"}));
        let id = mirror.upsert_entity(&created, &[], &stamp("s1")).await.unwrap();

        let mut updated = draft(RecordKind::Category, "1", json!({"name": "Breast surgery"}));
        updated.local_id = Some(id);
        let same = mirror.upsert_entity(&updated, &[], &stamp("s2")).await.unwrap();

        assert_eq!(same, id);
        assert_eq!(
            mirror.display_name(id).await.unwrap().as_deref(),
            Some("Breast surgery")
        );
        let counts = mirror.counts_by_kind(&tenant()).await.unwrap();
        assert_eq!(counts, vec![(RecordKind::Category, 1)]);
    }

    #[tokio::test]
    async fn test_update_of_missing_entity_rolls_back() {
        let (_dir, _pool, mirror) = setup().await;
        let mut orphan = draft(RecordKind::Category, "1", json!({"name": "Breast"}));
        orphan.local_id = Some(EntityId(42));

        assert!(mirror.upsert_entity(&orphan, &[], &stamp("s1")).await.is_err());
        let key = RegistryKey::new(tenant(), RecordKind::Category, "1");
        assert!(mirror.registry_entry(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stamp_requires_existing_entry() {
        let (_dir, _pool, mirror) = setup().await;
        let key = RegistryKey::new(tenant(), RecordKind::Case, "100");
        assert!(mirror.stamp_entry(&key, &stamp("s1")).await.is_err());

        let draft = draft(RecordKind::Case, "100", json!({"title": "Lift"}));
        mirror.upsert_entity(&draft, &[], &stamp("s1")).await.unwrap();
        mirror.stamp_entry(&key, &stamp("s2")).await.unwrap();

        let entry = mirror.registry_entry(&key).await.unwrap().unwrap();
        assert_eq!(entry.last_sync_session_id, SessionId::new("s2"));
    }

    #[tokio::test]
    async fn test_media_presence_and_pending_mark() {
        let (_dir, _pool, mirror) = setup().await;
        let case = draft(RecordKind::Case, "100", json!({"title": "Lift"}));
        let case_id = mirror.upsert_entity(&case, &[], &stamp("s1")).await.unwrap();
        assert!(!mirror.has_media(case_id).await.unwrap());

        mirror
            .attach_media(
                case_id,
                &[MediaRef {
                    url: "https://cdn.example.com/a.jpg".to_string(),
                    caption: None,
                }],
            )
            .await
            .unwrap();
        assert!(mirror.has_media(case_id).await.unwrap());

        let key = RegistryKey::new(tenant(), RecordKind::Case, "100");
        mirror.mark_pending(&key).await.unwrap();
        let entry = mirror.registry_entry(&key).await.unwrap().unwrap();
        assert!(entry.content_fingerprint.is_pending());
        assert_eq!(entry.last_sync_session_id, SessionId::new("s1"));

        let missing = RegistryKey::new(tenant(), RecordKind::Case, "999");
        assert!(mirror.mark_pending(&missing).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_cascades_terms_and_media() {
        let (_dir, pool, mirror) = setup().await;
        let category = draft(RecordKind::Category, "1", json!({"name": "Breast"}));
        let category_id = mirror.upsert_entity(&category, &[], &stamp("s1")).await.unwrap();
        let case = draft(RecordKind::Case, "100", json!({"title": "Lift"}));
        let case_id = mirror
            .upsert_entity(&case, &[category_id], &stamp("s1"))
            .await
            .unwrap();
        mirror
            .attach_media(
                case_id,
                &[MediaRef {
                    url: "https://cdn.example.com/a.jpg".to_string(),
                    caption: None,
                }],
            )
            .await
            .unwrap();

        let key = RegistryKey::new(tenant(), RecordKind::Case, "100");
        let entry = mirror.registry_entry(&key).await.unwrap().unwrap();
        assert!(mirror.delete_entity(&entry).await.unwrap());
        assert!(!mirror.delete_entity(&entry).await.unwrap());

        let (terms,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM entity_terms")
            .fetch_one(&pool)
            .await
            .unwrap();
        let (media,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM entity_media")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(terms, 0);
        assert_eq!(media, 0);
        assert!(mirror.display_name(case_id).await.unwrap().is_none());
        assert!(mirror.display_name(category_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_entries_outside_session_filters() {
        let (_dir, _pool, mirror) = setup().await;
        for (kind, id, session) in [
            (RecordKind::Category, "1", "old"),
            (RecordKind::Case, "100", "old"),
            (RecordKind::Case, "101", "new"),
        ] {
            let draft = draft(kind, id, json!({"name": "x", "title": "x"}));
            mirror.upsert_entity(&draft, &[], &stamp(session)).await.unwrap();
        }

        let all = mirror
            .entries_outside_session(&tenant(), &SessionId::new("new"), None)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let cases = mirror
            .entries_outside_session(&tenant(), &SessionId::new("new"), Some(RecordKind::Case))
            .await
            .unwrap();
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].external_id, "100");

        let other_tenant = mirror
            .entries_outside_session(&TenantToken::new("other"), &SessionId::new("new"), None)
            .await
            .unwrap();
        assert!(other_tenant.is_empty());
    }

    #[tokio::test]
    async fn test_lookup_term_ignores_cases() {
        let (_dir, _pool, mirror) = setup().await;
        let case = draft(RecordKind::Case, "100", json!({"title": "Lift"}));
        let id = mirror.upsert_entity(&case, &[], &stamp("s1")).await.unwrap();

        assert_eq!(
            mirror
                .lookup_by_external_id(&tenant(), RecordKind::Case, "100")
                .await
                .unwrap(),
            Some(id)
        );
        assert!(mirror
            .lookup_term(&tenant(), RecordKind::Case, "100")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_orchestrated_run_against_sqlite() {
        let (_dir, _pool, mirror) = setup().await;
        let mirror = Arc::new(mirror);
        let source = MemorySource::new()
            .with_categories(vec![RemoteRecord::new(
                RecordKind::Category,
                "1",
                json!({"name": "Breast"}),
            )])
            .with_procedures(vec![RemoteRecord::new(
                RecordKind::Procedure,
                "10",
                json!({"name": "Augmentation", "parentId": 1}),
            )])
            .with_cases(vec![RemoteRecord::new(
                RecordKind::Case,
                "100",
                json!({"procedureIds": [10], "patient": {"age": 34, "gender": "female"}}),
            )]);
        let orchestrator = Orchestrator::new(
            Arc::new(source),
            mirror.clone(),
            Arc::new(MemoryAuditLog::new()),
            Arc::new(MemoryLockStore::new()),
            SyncOptions {
                page_delay: Duration::ZERO,
                ..SyncOptions::default()
            },
        );

        let mut handle = orchestrator
            .start_run(tenant(), RunTrigger::Manual)
            .await
            .unwrap();
        let snapshot = handle.wait().await;

        assert_eq!(snapshot.status, RunStatus::Completed);
        assert_eq!(snapshot.items_processed, 3);
        let counts = mirror.counts_by_kind(&tenant()).await.unwrap();
        assert_eq!(counts.iter().map(|(_, n)| n).sum::<i64>(), 3);
    }

    #[tokio::test]
    async fn test_old_session_cannot_delete_sqlite_mirror() {
        let (_dir, pool, mirror) = setup().await;
        let mirror = Arc::new(mirror);
        let source = MemorySource::new().with_cases(vec![
            RemoteRecord::new(RecordKind::Case, "100", json!({"title": "A"})),
            RemoteRecord::new(RecordKind::Case, "101", json!({"title": "B"})),
        ]);
        let orchestrator = Orchestrator::new(
            Arc::new(source),
            mirror.clone(),
            Arc::new(SqliteAuditLog::new(pool)),
            Arc::new(MemoryLockStore::new()),
            SyncOptions {
                page_delay: Duration::ZERO,
                auto_delete_orphans: false,
                ..SyncOptions::default()
            },
        );

        let mut first = orchestrator
            .start_run(tenant(), RunTrigger::Manual)
            .await
            .unwrap();
        let old = first.wait().await;
        let mut second = orchestrator
            .start_run(tenant(), RunTrigger::Manual)
            .await
            .unwrap();
        second.wait().await;

        let err = orchestrator
            .list_orphans(&old.session_id, &tenant(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Session(SessionError::Superseded { .. })));
        let counts = mirror.counts_by_kind(&tenant()).await.unwrap();
        assert_eq!(counts, vec![(RecordKind::Case, 2)]);
    }
}
