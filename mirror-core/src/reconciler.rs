//! Mark-and-sweep removal of mirror entities that vanished upstream.
//!
//! The mark phase happens during a run: every registry entry the run touches
//! is stamped with the run's session id. The sweep runs afterwards and treats
//! every entry of the tenant carrying an older stamp as an orphan. It must
//! never run before all stages of the session have finished marking.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::capability::{AuditLog, Mirror};
use crate::error::{PersistError, ReconciliationError, SessionError, SyncError};
use crate::models::{
    DeletionRecord, RecordKind, RegistryEntry, RunScope, SessionId, SyncRun, TenantToken,
};

/// Runs of a tenant scanned when checking a reference session.
const RUN_WINDOW: usize = 200;

/// A registry entry whose remote counterpart was not seen in the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanCandidate {
    pub entry: RegistryEntry,
    pub display_name: String,
}

/// Orphan counts by kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrphanReport {
    pub by_kind: BTreeMap<RecordKind, usize>,
}

impl OrphanReport {
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a RegistryEntry>) -> Self {
        let mut by_kind = BTreeMap::new();
        for entry in entries {
            *by_kind.entry(entry.kind).or_insert(0) += 1;
        }
        Self { by_kind }
    }

    pub fn total(&self) -> usize {
        self.by_kind.values().sum()
    }

    pub fn count(&self, kind: RecordKind) -> usize {
        self.by_kind.get(&kind).copied().unwrap_or(0)
    }
}

/// Result of a deletion pass.
#[derive(Debug, Clone, Default)]
pub struct DeletionOutcome {
    pub deleted: Vec<DeletionRecord>,
    /// Candidates that were already gone or were re-stamped since listing.
    pub skipped: usize,
    pub errors: Vec<ReconciliationError>,
    /// Deletions that succeeded but whose audit row could not be written.
    pub audit_failures: Vec<String>,
}

impl DeletionOutcome {
    pub fn deleted_report(&self) -> OrphanReport {
        let mut by_kind = BTreeMap::new();
        for record in &self.deleted {
            *by_kind.entry(record.kind).or_insert(0) += 1;
        }
        OrphanReport { by_kind }
    }
}

/// A finished full run that may serve as the reference for an operator
/// sweep, plus the case refreshes that ran after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceSession {
    pub run: SyncRun,
    /// Entries stamped by these sessions were seen after the reference run.
    pub later_sessions: Vec<SessionId>,
}

#[derive(Clone)]
pub struct OrphanReconciler {
    mirror: Arc<dyn Mirror>,
    audit: Arc<dyn AuditLog>,
}

impl OrphanReconciler {
    pub fn new(mirror: Arc<dyn Mirror>, audit: Arc<dyn AuditLog>) -> Self {
        Self { mirror, audit }
    }

    /// Checks that `session_id` is a completed or partial full run of
    /// `tenant` with no full run after it. Any full run, even a failed one,
    /// re-stamps entries, so an older session would report live entities.
    pub async fn verify_reference_session(
        &self,
        session_id: &SessionId,
        tenant: &TenantToken,
    ) -> Result<ReferenceSession, SyncError> {
        let run = self
            .audit
            .find_run(session_id)
            .await?
            .ok_or_else(|| SessionError::Unknown(session_id.clone()))?;

        if &run.tenant != tenant {
            return Err(SessionError::OtherTenant {
                session_id: session_id.clone(),
                owner: run.tenant,
            }
            .into());
        }
        if run.scope != RunScope::Full {
            return Err(SessionError::NotFullRun {
                session_id: session_id.clone(),
                scope: run.scope,
            }
            .into());
        }
        if !run.is_sweep_reference() {
            return Err(SessionError::NotFinished {
                session_id: session_id.clone(),
                status: run.status,
            }
            .into());
        }

        let recent = self.audit.recent_runs(tenant, RUN_WINDOW).await?;
        let mut later_sessions = Vec::new();
        for later in &recent {
            if &later.session_id == session_id {
                return Ok(ReferenceSession {
                    run,
                    later_sessions,
                });
            }
            if later.scope == RunScope::Full {
                return Err(SessionError::Superseded {
                    session_id: session_id.clone(),
                    latest: later.session_id.clone(),
                }
                .into());
            }
            later_sessions.push(later.session_id.clone());
        }

        let latest = recent
            .first()
            .map_or_else(|| session_id.clone(), |r| r.session_id.clone());
        Err(SessionError::Superseded {
            session_id: session_id.clone(),
            latest,
        }
        .into())
    }

    /// Orphans an operator may review for `session_id`, after checking it
    /// with [`Self::verify_reference_session`].
    pub async fn review_orphans(
        &self,
        session_id: &SessionId,
        tenant: &TenantToken,
        kind: Option<RecordKind>,
    ) -> Result<Vec<OrphanCandidate>, SyncError> {
        let reference = self.verify_reference_session(session_id, tenant).await?;
        let mut entries = self.find_candidates(session_id, tenant, kind).await?;
        entries.retain(|e| !reference.later_sessions.contains(&e.last_sync_session_id));
        Ok(self.enrich(entries).await)
    }

    /// Registry entries of `tenant` not stamped with `session_id`.
    pub(crate) async fn find_candidates(
        &self,
        session_id: &SessionId,
        tenant: &TenantToken,
        kind: Option<RecordKind>,
    ) -> Result<Vec<RegistryEntry>, PersistError> {
        let mut entries = self
            .mirror
            .entries_outside_session(tenant, session_id, kind)
            .await?;
        // Never trust the store's filter with another tenant's rows.
        entries.retain(|e| {
            &e.tenant == tenant
                && &e.last_sync_session_id != session_id
                && kind.map_or(true, |k| e.kind == k)
        });
        entries.sort_by(|a, b| {
            (a.kind, &a.external_id).cmp(&(b.kind, &b.external_id))
        });
        Ok(entries)
    }

    /// Resolves a display name for each entry. Lookup failures degrade to a
    /// placeholder.
    pub async fn enrich(&self, entries: Vec<RegistryEntry>) -> Vec<OrphanCandidate> {
        let mut candidates = Vec::with_capacity(entries.len());
        for entry in entries {
            let display_name = match self.mirror.display_name(entry.local_id).await {
                Ok(Some(name)) if !name.trim().is_empty() => name,
                Ok(_) => placeholder_name(&entry),
                Err(e) => {
                    tracing::debug!("Name lookup for entity {} failed: {}", entry.local_id, e);
                    placeholder_name(&entry)
                }
            };
            candidates.push(OrphanCandidate {
                entry,
                display_name,
            });
        }
        candidates
    }

    /// Unchecked listing, used by a run's own sweep once marking is done.
    pub(crate) async fn list_orphans(
        &self,
        session_id: &SessionId,
        tenant: &TenantToken,
        kind: Option<RecordKind>,
    ) -> Result<Vec<OrphanCandidate>, PersistError> {
        let entries = self.find_candidates(session_id, tenant, kind).await?;
        Ok(self.enrich(entries).await)
    }

    /// Deletes each candidate's entity and registry entry, auditing every
    /// successful deletion. A failed candidate is left intact and reported.
    /// Callers must hold the tenant's lock.
    pub(crate) async fn delete_orphans(
        &self,
        candidates: &[OrphanCandidate],
        session_id: &SessionId,
    ) -> DeletionOutcome {
        let mut outcome = DeletionOutcome::default();

        for candidate in candidates {
            let entry = &candidate.entry;
            let failure = |message: String| ReconciliationError {
                kind: entry.kind,
                external_id: entry.external_id.clone(),
                local_id: entry.local_id,
                message,
            };

            // Re-read the entry: a later run may have re-stamped it.
            match self.mirror.registry_entry(&entry.key()).await {
                Ok(Some(current))
                    if current.last_sync_session_id == entry.last_sync_session_id
                        && &current.last_sync_session_id != session_id
                        && current.local_id == entry.local_id => {}
                Ok(_) => {
                    tracing::debug!(
                        "Skipping orphan {} {}: changed since listing",
                        entry.kind,
                        entry.external_id
                    );
                    outcome.skipped += 1;
                    continue;
                }
                Err(e) => {
                    outcome.errors.push(failure(e.message));
                    continue;
                }
            }

            match self.mirror.delete_entity(entry).await {
                Ok(true) => {
                    let record = DeletionRecord::for_entry(entry, session_id);
                    tracing::info!(
                        kind = %record.kind,
                        external_id = %record.external_id,
                        local_id = %record.local_id,
                        session_id = %record.session_id,
                        "Deleted orphan"
                    );
                    if let Err(e) = self.audit.record_deletion(&record).await {
                        tracing::error!(
                            "Failed to audit deletion of {} {}: {}",
                            record.kind,
                            record.external_id,
                            e
                        );
                        outcome
                            .audit_failures
                            .push(format!("{} {}: {}", record.kind, record.external_id, e));
                    }
                    outcome.deleted.push(record);
                }
                Ok(false) => outcome.skipped += 1,
                Err(e) => {
                    let err = failure(e.message);
                    tracing::warn!("{}", err);
                    outcome.errors.push(err);
                }
            }
        }

        outcome
    }

    pub fn report(candidates: &[OrphanCandidate]) -> OrphanReport {
        OrphanReport::from_entries(candidates.iter().map(|c| &c.entry))
    }
}

fn placeholder_name(entry: &RegistryEntry) -> String {
    format!("(unnamed {} {})", entry.kind, entry.external_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Fingerprint;
    use crate::memory::{MemoryAuditLog, MemoryMirror};
    use crate::models::{EntityId, RunStatus, RunTrigger};
    use chrono::Utc;

    fn entry(tenant: &str, kind: RecordKind, external_id: &str, local_id: i64, session: &str) -> RegistryEntry {
        RegistryEntry {
            tenant: TenantToken::new(tenant),
            kind,
            external_id: external_id.to_string(),
            local_id: EntityId(local_id),
            content_fingerprint: Fingerprint::from_hex("00"),
            last_synced_at: Utc::now(),
            last_sync_session_id: SessionId::new(session),
        }
    }

    fn setup() -> (Arc<MemoryMirror>, Arc<MemoryAuditLog>, OrphanReconciler) {
        let mirror = Arc::new(MemoryMirror::new());
        let audit = Arc::new(MemoryAuditLog::new());
        let reconciler = OrphanReconciler::new(mirror.clone(), audit.clone());
        (mirror, audit, reconciler)
    }

    #[tokio::test]
    async fn test_sweep_finds_only_stale_session_entries() {
        let (mirror, _audit, reconciler) = setup();
        mirror.insert_entry(entry("acme", RecordKind::Case, "A", 1, "5"), "A");
        mirror.insert_entry(entry("acme", RecordKind::Case, "B", 2, "5"), "B");
        mirror.insert_entry(entry("acme", RecordKind::Case, "C", 3, "4"), "C");

        let found = reconciler
            .find_candidates(&SessionId::new("5"), &TenantToken::new("acme"), None)
            .await
            .unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].external_id, "C");
    }

    #[tokio::test]
    async fn test_sweep_never_crosses_tenants() {
        let (mirror, _audit, reconciler) = setup();
        mirror.insert_entry(entry("acme", RecordKind::Case, "A", 1, "4"), "A");
        mirror.insert_entry(entry("globex", RecordKind::Case, "B", 2, "4"), "B");

        let found = reconciler
            .find_candidates(&SessionId::new("5"), &TenantToken::new("acme"), None)
            .await
            .unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].tenant, TenantToken::new("acme"));
    }

    #[tokio::test]
    async fn test_kind_filter() {
        let (mirror, _audit, reconciler) = setup();
        mirror.insert_entry(entry("acme", RecordKind::Procedure, "10", 1, "4"), "Lift");
        mirror.insert_entry(entry("acme", RecordKind::Case, "100", 2, "4"), "Case");

        let found = reconciler
            .find_candidates(
                &SessionId::new("5"),
                &TenantToken::new("acme"),
                Some(RecordKind::Procedure),
            )
            .await
            .unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, RecordKind::Procedure);
    }

    #[tokio::test]
    async fn test_enrich_uses_placeholder_on_lookup_failure() {
        let (mirror, _audit, reconciler) = setup();
        mirror.insert_entry(entry("acme", RecordKind::Case, "C", 3, "4"), "Lift case");
        mirror.fail_display_names(true);

        let candidates = reconciler
            .list_orphans(&SessionId::new("5"), &TenantToken::new("acme"), None)
            .await
            .unwrap();

        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].display_name, "(unnamed case C)");
    }

    #[tokio::test]
    async fn test_deleting_orphan_case_writes_one_audit_record() {
        let (mirror, audit, reconciler) = setup();
        mirror.insert_entry(entry("acme", RecordKind::Case, "100", 7, "4"), "Lift case");
        let session = SessionId::new("5");

        let candidates = reconciler
            .list_orphans(&session, &TenantToken::new("acme"), None)
            .await
            .unwrap();
        let outcome = reconciler.delete_orphans(&candidates, &session).await;

        assert_eq!(outcome.deleted.len(), 1);
        assert!(outcome.errors.is_empty());
        assert_eq!(mirror.entity_count(), 0);
        assert!(mirror.registry_entries().is_empty());

        let deletions = audit.deletions();
        assert_eq!(deletions.len(), 1);
        assert_eq!(deletions[0].kind, RecordKind::Case);
        assert_eq!(deletions[0].external_id, "100");
        assert_eq!(deletions[0].local_id, EntityId(7));
        assert_eq!(deletions[0].session_id, session);
    }

    #[tokio::test]
    async fn test_failed_delete_leaves_candidate_intact() {
        let (mirror, audit, reconciler) = setup();
        mirror.insert_entry(entry("acme", RecordKind::Case, "100", 7, "4"), "Keep");
        mirror.insert_entry(entry("acme", RecordKind::Case, "101", 8, "4"), "Drop");
        mirror.fail_delete_for(EntityId(7));
        let session = SessionId::new("5");

        let candidates = reconciler
            .list_orphans(&session, &TenantToken::new("acme"), None)
            .await
            .unwrap();
        let outcome = reconciler.delete_orphans(&candidates, &session).await;

        assert_eq!(outcome.deleted.len(), 1);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].external_id, "100");
        assert!(mirror.entity(EntityId(7)).is_some());
        assert_eq!(mirror.registry_entries().len(), 1);
        assert_eq!(audit.deletions().len(), 1);
    }

    #[tokio::test]
    async fn test_restamped_candidate_is_skipped() {
        let (mirror, audit, reconciler) = setup();
        mirror.insert_entry(entry("acme", RecordKind::Case, "100", 7, "4"), "Case");
        let session = SessionId::new("5");
        let candidates = reconciler
            .list_orphans(&session, &TenantToken::new("acme"), None)
            .await
            .unwrap();

        // A newer run sees the record again before the operator confirms.
        mirror.insert_entry(entry("acme", RecordKind::Case, "100", 7, "6"), "Case");
        let outcome = reconciler.delete_orphans(&candidates, &session).await;

        assert!(outcome.deleted.is_empty());
        assert_eq!(outcome.skipped, 1);
        assert_eq!(mirror.entity_count(), 1);
        assert!(audit.deletions().is_empty());
    }

    async fn log_run(audit: &MemoryAuditLog, session: &str, scope: RunScope, status: RunStatus) {
        let mut run = SyncRun::started(
            SessionId::new(session),
            TenantToken::new("acme"),
            RunTrigger::Manual,
        )
        .with_scope(scope);
        run.status = status;
        audit.record(&run).await.unwrap();
    }

    #[tokio::test]
    async fn test_latest_full_run_is_a_valid_reference() {
        let (_mirror, audit, reconciler) = setup();
        log_run(&audit, "4", RunScope::Full, RunStatus::Completed).await;
        log_run(&audit, "5", RunScope::Full, RunStatus::Partial).await;

        let reference = reconciler
            .verify_reference_session(&SessionId::new("5"), &TenantToken::new("acme"))
            .await
            .unwrap();
        assert_eq!(reference.run.status, RunStatus::Partial);
        assert!(reference.later_sessions.is_empty());
    }

    #[tokio::test]
    async fn test_run_still_in_progress_is_not_a_reference() {
        let (_mirror, audit, reconciler) = setup();
        log_run(&audit, "5", RunScope::Full, RunStatus::Started).await;

        let err = reconciler
            .verify_reference_session(&SessionId::new("5"), &TenantToken::new("acme"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            SyncError::Session(SessionError::NotFinished {
                session_id: SessionId::new("5"),
                status: RunStatus::Started,
            })
        );
    }

    #[tokio::test]
    async fn test_entries_from_later_case_refresh_are_not_orphans() {
        let (mirror, audit, reconciler) = setup();
        log_run(&audit, "5", RunScope::Full, RunStatus::Completed).await;
        log_run(&audit, "6", RunScope::Case, RunStatus::Completed).await;
        mirror.insert_entry(entry("acme", RecordKind::Case, "A", 1, "5"), "A");
        mirror.insert_entry(entry("acme", RecordKind::Case, "B", 2, "6"), "B");
        mirror.insert_entry(entry("acme", RecordKind::Case, "C", 3, "4"), "C");

        let candidates = reconciler
            .review_orphans(&SessionId::new("5"), &TenantToken::new("acme"), None)
            .await
            .unwrap();

        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].entry.external_id, "C");
    }

    #[tokio::test]
    async fn test_review_rejects_session_without_run_log() {
        let (mirror, _audit, reconciler) = setup();
        mirror.insert_entry(entry("acme", RecordKind::Case, "A", 1, "4"), "A");

        let err = reconciler
            .review_orphans(&SessionId::new("5"), &TenantToken::new("acme"), None)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            SyncError::Session(SessionError::Unknown(SessionId::new("5")))
        );
    }

    #[test]
    fn test_report_counts_by_kind() {
        let entries = vec![
            entry("acme", RecordKind::Case, "1", 1, "4"),
            entry("acme", RecordKind::Case, "2", 2, "4"),
            entry("acme", RecordKind::Category, "3", 3, "4"),
        ];
        let report = OrphanReport::from_entries(&entries);
        assert_eq!(report.count(RecordKind::Case), 2);
        assert_eq!(report.count(RecordKind::Category), 1);
        assert_eq!(report.count(RecordKind::Procedure), 0);
        assert_eq!(report.total(), 3);
    }
}
