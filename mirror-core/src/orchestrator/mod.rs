//! Runs the staged sync pipeline for one tenant at a time.
//!
//! A run acquires the tenant's [`SyncLock`], writes a `started` row to the
//! run log, and then executes taxonomies → procedures → cases → (media) →
//! orphan sweep on a background task. Callers get a [`RunHandle`] to watch,
//! cancel or await the run. Whatever happens inside the pipeline, including
//! a panic, the run log is finalized and the lock released.

mod context;
mod progress;

pub use progress::{Progress, RunPhase, RunSnapshot, Stage};

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::capability::{AuditLog, LockStore, Mirror, Source};
use crate::detector::{ChangeDetector, Classification};
use crate::error::{PersistError, RecordError, SourceError, SyncError};
use crate::fingerprint::Fingerprint;
use crate::lock::{LockToken, SyncLock};
use crate::mapper::{self, EntityMapper};
use crate::models::{
    EntityDraft, EntityId, RecordKind, RegistryEntry, RegistryKey, RemoteRecord, RunScope,
    RunStatus, RunTrigger, SessionId, SyncRun, SyncStamp, TenantToken,
};
use crate::reconciler::{DeletionOutcome, OrphanCandidate, OrphanReconciler};
use context::{MediaJob, RecordAction, RunContext};

/// Full pages beyond the advertised total before paging is considered broken.
const MAX_EXTRA_PAGES: u32 = 50;

/// Knobs for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    pub page_size: u32,
    /// Pause between case pages, to stay polite with the upstream API.
    pub page_delay: Duration,
    pub lock_ttl: Duration,
    pub force_update: bool,
    pub sync_media: bool,
    /// Delete orphans at the end of a run. When false they are only counted
    /// and left for an operator.
    pub auto_delete_orphans: bool,
    /// Attempts per session stamp write.
    pub stamp_retries: u32,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            page_size: 20,
            page_delay: Duration::from_millis(250),
            lock_ttl: Duration::from_secs(3600),
            force_update: false,
            sync_media: false,
            auto_delete_orphans: true,
            stamp_retries: 3,
        }
    }
}

#[derive(Debug, Clone)]
enum RunPlan {
    Full,
    /// Re-sync one case. Never sweeps.
    SingleCase(String),
}

impl RunPlan {
    fn scope(&self) -> RunScope {
        match self {
            RunPlan::Full => RunScope::Full,
            RunPlan::SingleCase(_) => RunScope::Case,
        }
    }
}

/// Handle to a run started by [`Orchestrator::start_run`].
pub struct RunHandle {
    session_id: SessionId,
    tenant: TenantToken,
    cancel: Arc<AtomicBool>,
    status: watch::Receiver<RunSnapshot>,
    task: Option<JoinHandle<RunSnapshot>>,
}

impl RunHandle {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn tenant(&self) -> &TenantToken {
        &self.tenant
    }

    /// Asks the run to stop. It finishes the record in flight, skips the
    /// sweep, and ends as `failed` with reason `cancelled`.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> RunSnapshot {
        self.status.borrow().clone()
    }

    /// Waits for the next published snapshot. Returns false once the run
    /// will publish no more.
    pub async fn changed(&mut self) -> bool {
        self.status.changed().await.is_ok()
    }

    /// Waits for the run to finish and returns its final snapshot.
    pub async fn wait(&mut self) -> RunSnapshot {
        if let Some(task) = self.task.take() {
            match task.await {
                Ok(snapshot) => return snapshot,
                Err(e) => tracing::error!("Sync run task for {} failed: {}", self.session_id, e),
            }
        }
        self.snapshot()
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    source: Arc<dyn Source>,
    mirror: Arc<dyn Mirror>,
    audit: Arc<dyn AuditLog>,
    lock: SyncLock,
    reconciler: OrphanReconciler,
    detector: ChangeDetector,
    options: SyncOptions,
}

impl Orchestrator {
    pub fn new(
        source: Arc<dyn Source>,
        mirror: Arc<dyn Mirror>,
        audit: Arc<dyn AuditLog>,
        locks: Arc<dyn LockStore>,
        options: SyncOptions,
    ) -> Self {
        Self {
            reconciler: OrphanReconciler::new(mirror.clone(), audit.clone()),
            detector: ChangeDetector::new(options.force_update),
            lock: SyncLock::new(locks),
            source,
            mirror,
            audit,
            options,
        }
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Starts a full run for `tenant`. Fails with
    /// [`SyncError::AlreadyRunning`] if the tenant's lock is held.
    pub async fn start_run(
        &self,
        tenant: TenantToken,
        trigger: RunTrigger,
    ) -> Result<RunHandle, SyncError> {
        self.launch(tenant, trigger, RunPlan::Full).await
    }

    /// Starts a run that re-syncs a single case and never sweeps.
    pub async fn start_case_refresh(
        &self,
        tenant: TenantToken,
        external_id: impl Into<String>,
    ) -> Result<RunHandle, SyncError> {
        self.launch(tenant, RunTrigger::Manual, RunPlan::SingleCase(external_id.into()))
            .await
    }

    pub fn cancel_run(&self, handle: &RunHandle) {
        tracing::info!("Cancellation requested for run {}", handle.session_id);
        handle.cancel();
    }

    pub fn get_run_status(&self, handle: &RunHandle) -> RunSnapshot {
        handle.snapshot()
    }

    /// Progress of an active run, or `None` once it has finished.
    pub fn get_progress(&self, handle: &RunHandle) -> Option<Progress> {
        let snapshot = handle.snapshot();
        (!snapshot.is_finished()).then_some(snapshot.progress)
    }

    /// Orphans relative to `session_id`, which must be the tenant's latest
    /// finished full run.
    pub async fn list_orphans(
        &self,
        session_id: &SessionId,
        tenant: &TenantToken,
        kind: Option<RecordKind>,
    ) -> Result<Vec<OrphanCandidate>, SyncError> {
        self.reconciler.review_orphans(session_id, tenant, kind).await
    }

    /// Deletes previously listed orphans while holding the lock of every
    /// tenant involved, so no run can re-stamp them mid-deletion. The
    /// session is re-checked under the locks and must still be each
    /// tenant's latest finished full run.
    pub async fn delete_orphans(
        &self,
        candidates: &[OrphanCandidate],
        session_id: &SessionId,
    ) -> Result<DeletionOutcome, SyncError> {
        let mut tenants: Vec<&TenantToken> = candidates.iter().map(|c| &c.entry.tenant).collect();
        tenants.sort();
        tenants.dedup();

        let mut tokens = Vec::with_capacity(tenants.len());
        for tenant in tenants {
            match self.lock.acquire(tenant, self.options.lock_ttl).await {
                Ok(token) => tokens.push(token),
                Err(e) => {
                    self.release_all(&tokens).await;
                    return Err(e.into());
                }
            }
        }

        let mut later_sessions = HashSet::new();
        for token in &tokens {
            match self
                .reconciler
                .verify_reference_session(session_id, &token.tenant)
                .await
            {
                Ok(reference) => later_sessions.extend(reference.later_sessions),
                Err(e) => {
                    self.release_all(&tokens).await;
                    return Err(e);
                }
            }
        }

        let (live, stale): (Vec<OrphanCandidate>, Vec<OrphanCandidate>) = candidates
            .iter()
            .cloned()
            .partition(|c| later_sessions.contains(&c.entry.last_sync_session_id));
        let mut outcome = self.reconciler.delete_orphans(&stale, session_id).await;
        outcome.skipped += live.len();
        self.release_all(&tokens).await;
        Ok(outcome)
    }

    pub async fn recent_runs(
        &self,
        tenant: &TenantToken,
        limit: usize,
    ) -> Result<Vec<SyncRun>, PersistError> {
        self.audit.recent_runs(tenant, limit).await
    }

    async fn launch(
        &self,
        tenant: TenantToken,
        trigger: RunTrigger,
        plan: RunPlan,
    ) -> Result<RunHandle, SyncError> {
        let token = self.lock.acquire(&tenant, self.options.lock_ttl).await?;

        let session_id = SessionId::generate();
        let run =
            SyncRun::started(session_id.clone(), tenant.clone(), trigger).with_scope(plan.scope());
        if let Err(e) = self.audit.record(&run).await {
            self.release(&token).await;
            return Err(e.into());
        }
        tracing::info!(
            "Started {} sync run {} for tenant {}",
            trigger,
            session_id,
            tenant
        );

        let cancel = Arc::new(AtomicBool::new(false));
        let ctx = RunContext::new(run, cancel.clone());
        let status = ctx.subscribe();
        let this = self.clone();
        let task = tokio::spawn(async move { this.drive(ctx, plan, token).await });

        Ok(RunHandle {
            session_id,
            tenant,
            cancel,
            status,
            task: Some(task),
        })
    }

    /// Runs the pipeline on its own task and finalizes whatever comes back.
    async fn drive(self, ctx: RunContext, plan: RunPlan, token: LockToken) -> RunSnapshot {
        let publisher = ctx.publisher();
        let inner = self.clone();
        let pipeline = tokio::spawn(async move {
            let mut ctx = ctx;
            let result = inner.run_stages(&mut ctx, &plan).await;
            let snapshot = ctx.finish(result);
            (snapshot, ctx.run_log())
        });

        let (snapshot, run) = match pipeline.await {
            Ok(done) => done,
            Err(e) => {
                tracing::error!("Sync pipeline aborted: {}", e);
                aborted(publisher.borrow().clone(), &e.to_string())
            }
        };

        if let Err(e) = self.audit.record(&run).await {
            tracing::error!("Failed to finalize run log for {}: {}", run.session_id, e);
        }
        self.release(&token).await;

        tracing::info!(
            "Sync run {} finished: {} ({} processed, {} failed, {} orphan(s) deleted)",
            snapshot.session_id,
            snapshot.status,
            snapshot.items_processed,
            snapshot.items_failed,
            snapshot.orphans_deleted
        );
        publisher.send_replace(snapshot.clone());
        snapshot
    }

    async fn run_stages(&self, ctx: &mut RunContext, plan: &RunPlan) -> Result<(), SyncError> {
        match plan {
            RunPlan::Full => {
                self.sync_terms(ctx, Stage::Taxonomies).await?;
                self.sync_terms(ctx, Stage::Procedures).await?;
                self.sync_cases(ctx).await?;
                if self.options.sync_media {
                    self.sync_media(ctx).await?;
                }
                self.sweep(ctx).await;
            }
            RunPlan::SingleCase(external_id) => {
                self.index_procedures(ctx).await?;
                self.sync_one_case(ctx, external_id).await?;
                if self.options.sync_media {
                    self.sync_media(ctx).await?;
                }
            }
        }
        Ok(())
    }

    async fn sync_terms(&self, ctx: &mut RunContext, stage: Stage) -> Result<(), SyncError> {
        ctx.enter(RunPhase::Syncing(stage));
        let fetched = match stage {
            Stage::Taxonomies => self.source.fetch_categories().await,
            _ => self.source.fetch_procedures().await,
        };
        let mut records = fetched.map_err(|source| SyncError::SourceUnavailable { stage, source })?;
        if stage == Stage::Taxonomies {
            records = parents_first(records);
        }
        tracing::info!("Syncing {} {} record(s)", records.len(), stage);

        let total = records.len() as u64;
        let page_size = self.options.page_size.max(1) as usize;
        let mut done = 0u64;
        for chunk in records.chunks(page_size) {
            for record in chunk {
                ctx.check_cancelled()?;
                self.process_record(ctx, record).await;
            }
            done += chunk.len() as u64;
            ctx.set_stage_progress(stage, done, total);
        }
        Ok(())
    }

    async fn sync_cases(&self, ctx: &mut RunContext) -> Result<(), SyncError> {
        let stage = Stage::Cases;
        let unavailable = |source: SourceError| SyncError::SourceUnavailable { stage, source };
        ctx.enter(RunPhase::Syncing(stage));

        let total = self.source.total_cases().await.map_err(unavailable)?;
        let size = self.options.page_size.max(1);
        let expected_pages = u32::try_from(total.div_ceil(u64::from(size))).unwrap_or(u32::MAX);
        tracing::info!("Syncing {} case(s) in pages of {}", total, size);

        let mut page = 1u32;
        let mut seen = 0u64;
        loop {
            ctx.check_cancelled()?;
            let records = self
                .source
                .fetch_cases_page(page, size)
                .await
                .map_err(unavailable)?;
            if records.is_empty() {
                break;
            }

            let count = records.len();
            for record in &records {
                ctx.check_cancelled()?;
                self.process_record(ctx, record).await;
            }
            seen += count as u64;
            ctx.set_stage_progress(stage, seen, total);
            tracing::debug!("Case page {} done ({} record(s))", page, count);

            if (count as u32) < size {
                break;
            }
            if page >= expected_pages.saturating_add(MAX_EXTRA_PAGES) {
                // Stopping here would sweep every case not yet seen.
                return Err(unavailable(SourceError::InvalidResponse(format!(
                    "case paging did not terminate after {} pages",
                    page
                ))));
            }
            page += 1;
            if !self.options.page_delay.is_zero() {
                tokio::time::sleep(self.options.page_delay).await;
            }
        }
        Ok(())
    }

    /// Loads procedure names for case titles without writing anything.
    async fn index_procedures(&self, ctx: &mut RunContext) -> Result<(), SyncError> {
        let records = self
            .source
            .fetch_procedures()
            .await
            .map_err(|source| SyncError::SourceUnavailable {
                stage: Stage::Procedures,
                source,
            })?;
        for record in &records {
            if let Some(summary) = mapper::procedure_summary(record) {
                ctx.procedures.insert(record.external_id.clone(), summary);
            }
        }
        Ok(())
    }

    async fn sync_one_case(&self, ctx: &mut RunContext, external_id: &str) -> Result<(), SyncError> {
        let stage = Stage::Cases;
        ctx.enter(RunPhase::Syncing(stage));
        ctx.check_cancelled()?;
        let record = self
            .source
            .fetch_case(external_id)
            .await
            .map_err(|source| SyncError::SourceUnavailable { stage, source })?;
        match record {
            Some(record) => self.process_record(ctx, &record).await,
            None => ctx.warn(format!("case '{}' was not found upstream", external_id)),
        }
        ctx.set_stage_progress(stage, 1, 1);
        Ok(())
    }

    async fn sync_media(&self, ctx: &mut RunContext) -> Result<(), SyncError> {
        let stage = Stage::Media;
        ctx.enter(RunPhase::Syncing(stage));
        let jobs = std::mem::take(&mut ctx.media_jobs);
        let total = jobs.len() as u64;
        for (i, job) in jobs.iter().enumerate() {
            ctx.check_cancelled()?;
            if let Err(e) = self.mirror.attach_media(job.local_id, &job.media).await {
                ctx.warn(format!("media for {}: {}", job.key, e));
                // The next run rewrites the case and tries again.
                if let Err(e) = self.mirror.mark_pending(&job.key).await {
                    ctx.warn(format!("could not mark {} for retry: {}", job.key, e));
                }
            }
            ctx.set_stage_progress(stage, i as u64 + 1, total);
        }
        Ok(())
    }

    /// Mark-and-sweep over the tenant. Only reached once every stage has
    /// finished marking without a run-level failure.
    async fn sweep(&self, ctx: &mut RunContext) {
        ctx.enter(RunPhase::Sweeping);
        let candidates = match self
            .reconciler
            .list_orphans(&ctx.session_id, &ctx.tenant, None)
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                ctx.error(format!("orphan sweep failed: {}", e));
                return;
            }
        };
        let report = OrphanReconciler::report(&candidates);
        ctx.orphans_found = report.by_kind.clone();
        if candidates.is_empty() {
            return;
        }

        if !self.options.auto_delete_orphans {
            ctx.warn(format!(
                "{} orphan(s) left for review (session {})",
                report.total(),
                ctx.session_id
            ));
            return;
        }

        let outcome = self
            .reconciler
            .delete_orphans(&candidates, &ctx.session_id)
            .await;
        ctx.orphans_deleted = outcome.deleted.len();
        for err in outcome.errors {
            ctx.error(err.to_string());
        }
        for failure in outcome.audit_failures {
            ctx.warn(format!("deletion not audited: {}", failure));
        }
    }

    /// Processes one record. Failures are recorded on the run and never
    /// propagate.
    async fn process_record(&self, ctx: &mut RunContext, record: &RemoteRecord) {
        ctx.note_pulled();
        let key = match mapper::record_key(&ctx.tenant, record) {
            Ok(key) => key,
            Err(e) => return ctx.record_failure(record, e.into()),
        };
        let existing = match self.mirror.registry_entry(&key).await {
            Ok(existing) => existing,
            Err(e) => return ctx.record_failure(record, e.into()),
        };

        match self.apply_record(ctx, record, &key, existing.as_ref()).await {
            Ok(action) => ctx.record_success(record, action),
            Err(err) => {
                ctx.record_failure(record, err);
                // Still upstream, so keep the old copy out of the sweep.
                if existing.is_some() {
                    if let Err(e) = self.mirror.stamp_entry(&key, &ctx.stamp()).await {
                        ctx.warn(format!("could not keep {} alive: {}", key, e));
                    }
                }
            }
        }
    }

    async fn apply_record(
        &self,
        ctx: &mut RunContext,
        record: &RemoteRecord,
        key: &RegistryKey,
        existing: Option<&RegistryEntry>,
    ) -> Result<RecordAction, RecordError> {
        if record.kind == RecordKind::Procedure {
            if let Some(summary) = mapper::procedure_summary(record) {
                ctx.procedures.insert(record.external_id.clone(), summary);
            }
        }

        let detection = self.detector.classify(record, existing);
        let stamp = ctx.stamp();
        let (mut draft, action) = match detection.classification {
            Classification::Unchanged(local_id) => {
                self.stamp_with_retry(key, &stamp).await?;
                if record.kind == RecordKind::Case && self.options.sync_media {
                    self.queue_missing_media(ctx, record, key, local_id).await;
                }
                return Ok(RecordAction::Unchanged);
            }
            Classification::Create => (
                EntityMapper::new(&ctx.tenant, &ctx.procedures).to_create(record)?,
                RecordAction::Created,
            ),
            Classification::Update(local_id) => (
                EntityMapper::new(&ctx.tenant, &ctx.procedures).to_update(record, local_id)?,
                RecordAction::Updated,
            ),
        };

        let (terms, unresolved) = self.resolve_terms(ctx, &draft).await?;
        if unresolved > 0 {
            // Rewrite on the next run, when the missing terms may exist.
            draft.fingerprint = Fingerprint::pending();
        }
        let local_id = self.mirror.upsert_entity(&draft, &terms, &stamp).await?;
        if draft.kind == RecordKind::Case {
            ctx.media_jobs.push(MediaJob {
                key: key.clone(),
                local_id,
                media: draft.media,
            });
        }
        Ok(action)
    }

    /// Queues an unchanged case for the media stage when it carries media
    /// upstream but none is stored.
    async fn queue_missing_media(
        &self,
        ctx: &mut RunContext,
        record: &RemoteRecord,
        key: &RegistryKey,
        local_id: EntityId,
    ) {
        let mapped = EntityMapper::new(&ctx.tenant, &ctx.procedures).to_update(record, local_id);
        let media = match mapped {
            Ok(draft) if !draft.media.is_empty() => draft.media,
            Ok(_) => return,
            Err(e) => return ctx.warn(format!("media for {}: {}", key, e)),
        };
        match self.mirror.has_media(local_id).await {
            Ok(true) => {}
            Ok(false) => ctx.media_jobs.push(MediaJob {
                key: key.clone(),
                local_id,
                media,
            }),
            Err(e) => ctx.warn(format!("media check for {}: {}", key, e)),
        }
    }

    /// Local ids of the terms a draft links to, and how many links were
    /// dropped with a warning because the term is not mirrored.
    async fn resolve_terms(
        &self,
        ctx: &mut RunContext,
        draft: &EntityDraft,
    ) -> Result<(Vec<EntityId>, usize), PersistError> {
        let mut terms = Vec::with_capacity(draft.term_refs.len());
        let mut unresolved = 0;
        for term in &draft.term_refs {
            match self
                .mirror
                .lookup_term(&ctx.tenant, term.kind, &term.external_id)
                .await?
            {
                Some(id) if !terms.contains(&id) => terms.push(id),
                Some(_) => {}
                None => {
                    unresolved += 1;
                    ctx.warn(format!(
                        "{} '{}' links to unknown {} '{}'",
                        draft.kind, draft.external_id, term.kind, term.external_id
                    ));
                }
            }
        }
        Ok((terms, unresolved))
    }

    async fn stamp_with_retry(&self, key: &RegistryKey, stamp: &SyncStamp) -> Result<(), PersistError> {
        let attempts = self.options.stamp_retries.max(1);
        let mut attempt = 1;
        loop {
            match self.mirror.stamp_entry(key, stamp).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    tracing::debug!("Stamp of {} failed (attempt {}): {}", key, attempt, e);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn release(&self, token: &LockToken) {
        if let Err(e) = self.lock.release(token).await {
            tracing::error!("Failed to release sync lock for {}: {}", token.tenant, e);
        }
    }

    async fn release_all(&self, tokens: &[LockToken]) {
        for token in tokens {
            self.release(token).await;
        }
    }
}

/// Final snapshot and run log for a pipeline task that died without
/// reporting back.
fn aborted(mut snapshot: RunSnapshot, reason: &str) -> (RunSnapshot, SyncRun) {
    let message = format!("run aborted: {}", reason);
    snapshot.status = RunStatus::Failed;
    snapshot.phase = RunPhase::Finished;
    snapshot.ended_at = Some(chrono::Utc::now());
    snapshot.progress.errors.push(message.clone());
    snapshot.failure = Some(message);

    let run = SyncRun {
        session_id: snapshot.session_id.clone(),
        tenant: snapshot.tenant.clone(),
        trigger: snapshot.trigger,
        scope: snapshot.scope,
        status: snapshot.status,
        started_at: snapshot.started_at,
        ended_at: snapshot.ended_at,
        items_processed: snapshot.items_processed,
        items_failed: snapshot.items_failed,
        error_summary: snapshot.progress.errors.clone(),
    };
    (snapshot, run)
}

/// Orders categories so every parent comes before its children. Records in
/// a parent cycle keep their upstream order at the end.
fn parents_first(records: Vec<RemoteRecord>) -> Vec<RemoteRecord> {
    let ids: HashSet<String> = records.iter().map(|r| r.external_id.clone()).collect();
    let mut placed: HashSet<String> = HashSet::new();
    let mut ordered = Vec::with_capacity(records.len());
    let mut pending = records;

    while !pending.is_empty() {
        let before = pending.len();
        let (ready, rest): (Vec<_>, Vec<_>) =
            pending.into_iter().partition(|r| match mapper::term_parent(r) {
                Some(parent) => !ids.contains(&parent) || placed.contains(&parent),
                None => true,
            });
        placed.extend(ready.iter().map(|r| r.external_id.clone()));
        ordered.extend(ready);
        pending = rest;
        if pending.len() == before {
            ordered.append(&mut pending);
        }
    }
    ordered
}
