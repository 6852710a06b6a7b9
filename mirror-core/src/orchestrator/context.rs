use chrono::Utc;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use super::progress::{Progress, RunPhase, RunSnapshot, Stage};
use crate::error::{RecordError, SyncError};
use crate::mapper::ProcedureIndex;
use crate::models::{
    EntityId, MediaRef, RecordKind, RegistryKey, RemoteRecord, RunStatus, SessionId, SyncRun,
    SyncStamp, TenantToken,
};

const MAX_MESSAGES: usize = 50;
const RECENT_ITEMS: usize = 10;

/// What happened to a record that was processed successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecordAction {
    Created,
    Updated,
    Unchanged,
}

/// Media the media stage should write for one case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MediaJob {
    pub key: RegistryKey,
    pub local_id: EntityId,
    pub media: Vec<MediaRef>,
}

/// Capped list of messages that remembers how many were dropped.
#[derive(Debug, Default)]
struct MessageLog {
    kept: Vec<String>,
    dropped: usize,
}

impl MessageLog {
    fn push(&mut self, message: String) {
        if self.kept.len() < MAX_MESSAGES {
            self.kept.push(message);
        } else {
            self.dropped += 1;
        }
    }

    fn total(&self) -> usize {
        self.kept.len() + self.dropped
    }

    fn render(&self) -> Vec<String> {
        let mut out = self.kept.clone();
        if self.dropped > 0 {
            out.push(format!("... and {} more", self.dropped));
        }
        out
    }
}

/// State owned by one active run. Created when the lock is acquired and
/// dropped when the run is finalized.
pub(crate) struct RunContext {
    pub tenant: TenantToken,
    pub session_id: SessionId,
    pub procedures: ProcedureIndex,
    /// Cases written this run, plus unchanged cases with no stored media.
    pub media_jobs: Vec<MediaJob>,
    pub orphans_found: BTreeMap<RecordKind, usize>,
    pub orphans_deleted: usize,
    run: SyncRun,
    phase: RunPhase,
    percent: u8,
    pulled: u64,
    created: u64,
    updated: u64,
    unchanged: u64,
    errors: MessageLog,
    warnings: MessageLog,
    recent: VecDeque<String>,
    failure: Option<String>,
    cancel: Arc<AtomicBool>,
    publisher: Arc<watch::Sender<RunSnapshot>>,
}

impl RunContext {
    pub fn new(run: SyncRun, cancel: Arc<AtomicBool>) -> Self {
        let (publisher, _) = watch::channel(RunSnapshot::started(&run));
        Self {
            tenant: run.tenant.clone(),
            session_id: run.session_id.clone(),
            procedures: ProcedureIndex::new(),
            media_jobs: Vec::new(),
            orphans_found: BTreeMap::new(),
            orphans_deleted: 0,
            run,
            phase: RunPhase::Locked,
            percent: 0,
            pulled: 0,
            created: 0,
            updated: 0,
            unchanged: 0,
            errors: MessageLog::default(),
            warnings: MessageLog::default(),
            recent: VecDeque::with_capacity(RECENT_ITEMS),
            failure: None,
            cancel,
            publisher: Arc::new(publisher),
        }
    }

    pub fn publisher(&self) -> Arc<watch::Sender<RunSnapshot>> {
        self.publisher.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunSnapshot> {
        self.publisher.subscribe()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn check_cancelled(&self) -> Result<(), SyncError> {
        if self.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }

    pub fn stamp(&self) -> SyncStamp {
        SyncStamp::new(self.session_id.clone())
    }

    pub fn enter(&mut self, phase: RunPhase) {
        self.phase = phase;
        self.percent = match phase {
            RunPhase::Locked => 0,
            RunPhase::Syncing(stage) => stage.percent_range().0,
            RunPhase::Sweeping => 95,
            RunPhase::Finished => 100,
        };
        self.publish();
    }

    pub fn set_stage_progress(&mut self, stage: Stage, done: u64, total: u64) {
        let (start, end) = stage.percent_range();
        let span = u64::from(end - start);
        let advanced = if total == 0 {
            span
        } else {
            span * done.min(total) / total
        };
        self.percent = start + advanced as u8;
        self.publish();
    }

    pub fn note_pulled(&mut self) {
        self.pulled += 1;
    }

    pub fn record_success(&mut self, record: &RemoteRecord, action: RecordAction) {
        self.run.items_processed += 1;
        let verb = match action {
            RecordAction::Created => {
                self.created += 1;
                "created"
            }
            RecordAction::Updated => {
                self.updated += 1;
                "updated"
            }
            RecordAction::Unchanged => {
                self.unchanged += 1;
                "unchanged"
            }
        };
        if self.recent.len() == RECENT_ITEMS {
            self.recent.pop_front();
        }
        self.recent
            .push_back(format!("{} {} {}", verb, record.kind, record.external_id));
        self.publish();
    }

    pub fn record_failure(&mut self, record: &RemoteRecord, err: RecordError) {
        self.run.items_failed += 1;
        tracing::warn!("Failed to sync {} '{}': {}", record.kind, record.external_id, err);
        self.errors
            .push(format!("{} '{}': {}", record.kind, record.external_id, err));
        self.publish();
    }

    pub fn error(&mut self, message: String) {
        tracing::warn!("{}", message);
        self.errors.push(message);
        self.publish();
    }

    pub fn warn(&mut self, message: String) {
        tracing::debug!("{}", message);
        self.warnings.push(message);
        self.publish();
    }

    /// Closes the run and returns its final snapshot.
    pub fn finish(&mut self, result: Result<(), SyncError>) -> RunSnapshot {
        let status = match &result {
            Err(_) => RunStatus::Failed,
            Ok(()) if self.errors.total() > 0 => RunStatus::Partial,
            Ok(()) => RunStatus::Completed,
        };
        if let Err(err) = result {
            let message = match err {
                SyncError::Cancelled => "cancelled".to_string(),
                other => format!("[{}] {}", phase_marker(self.phase), other),
            };
            self.errors.push(message.clone());
            self.failure = Some(message);
        } else {
            self.percent = 100;
        }
        self.phase = RunPhase::Finished;
        self.run.status = status;
        self.run.ended_at = Some(Utc::now());
        self.snapshot(status)
    }

    /// Run log row matching the current state.
    pub fn run_log(&self) -> SyncRun {
        let mut run = self.run.clone();
        run.error_summary = self.errors.render();
        run
    }

    fn publish(&self) {
        self.publisher
            .send_replace(self.snapshot(RunStatus::Started));
    }

    fn snapshot(&self, status: RunStatus) -> RunSnapshot {
        RunSnapshot {
            session_id: self.session_id.clone(),
            tenant: self.tenant.clone(),
            trigger: self.run.trigger,
            scope: self.run.scope,
            status,
            phase: self.phase,
            progress: Progress {
                stage: match self.phase {
                    RunPhase::Syncing(stage) => Some(stage),
                    _ => None,
                },
                percent: self.percent,
                recent_items: self.recent.iter().cloned().collect(),
                errors: self.errors.render(),
                warnings: self.warnings.render(),
            },
            started_at: self.run.started_at,
            ended_at: self.run.ended_at,
            items_pulled: self.pulled,
            items_processed: self.run.items_processed,
            items_failed: self.run.items_failed,
            created: self.created,
            updated: self.updated,
            unchanged: self.unchanged,
            orphans_found: self.orphans_found.clone(),
            orphans_deleted: self.orphans_deleted,
            failure: self.failure.clone(),
        }
    }
}

fn phase_marker(phase: RunPhase) -> &'static str {
    match phase {
        RunPhase::Locked => "start",
        RunPhase::Syncing(stage) => stage.as_str(),
        RunPhase::Sweeping => "sweep",
        RunPhase::Finished => "finish",
    }
}
