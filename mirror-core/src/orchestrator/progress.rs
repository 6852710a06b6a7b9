use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::models::{RecordKind, RunScope, RunStatus, RunTrigger, SessionId, SyncRun, TenantToken};

/// Sync stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Taxonomies,
    Procedures,
    Cases,
    Media,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Taxonomies => "taxonomies",
            Stage::Procedures => "procedures",
            Stage::Cases => "cases",
            Stage::Media => "media",
        }
    }

    /// Share of the overall progress bar covered by each stage, as
    /// `(start, end)` percentages.
    pub(crate) fn percent_range(&self) -> (u8, u8) {
        match self {
            Stage::Taxonomies => (0, 10),
            Stage::Procedures => (10, 25),
            Stage::Cases => (25, 90),
            Stage::Media => (90, 95),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a run currently is in its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "phase", content = "stage")]
pub enum RunPhase {
    Locked,
    Syncing(Stage),
    Sweeping,
    Finished,
}

/// Operator-facing progress of an active run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub stage: Option<Stage>,
    pub percent: u8,
    pub recent_items: Vec<String>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Complete observable state of a run. Published as a whole after every
/// change so readers never see a half-updated view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSnapshot {
    pub session_id: SessionId,
    pub tenant: TenantToken,
    pub trigger: RunTrigger,
    pub scope: RunScope,
    pub status: RunStatus,
    pub phase: RunPhase,
    pub progress: Progress,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub items_pulled: u64,
    pub items_processed: u64,
    pub items_failed: u64,
    pub created: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub orphans_found: BTreeMap<RecordKind, usize>,
    pub orphans_deleted: usize,
    pub failure: Option<String>,
}

impl RunSnapshot {
    /// Snapshot of a run that has just acquired its lock.
    pub fn started(run: &SyncRun) -> Self {
        Self {
            session_id: run.session_id.clone(),
            tenant: run.tenant.clone(),
            trigger: run.trigger,
            scope: run.scope,
            status: run.status,
            phase: RunPhase::Locked,
            progress: Progress::default(),
            started_at: run.started_at,
            ended_at: run.ended_at,
            items_pulled: 0,
            items_processed: run.items_processed,
            items_failed: run.items_failed,
            created: 0,
            updated: 0,
            unchanged: 0,
            orphans_found: BTreeMap::new(),
            orphans_deleted: 0,
            failure: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.phase == RunPhase::Finished
    }
}
