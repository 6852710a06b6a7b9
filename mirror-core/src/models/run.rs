use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::record::TenantToken;
use super::registry::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Started,
    Completed,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Started => "started",
            RunStatus::Completed => "completed",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_final(&self) -> bool {
        !matches!(self, RunStatus::Started)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(RunStatus::Started),
            "completed" => Ok(RunStatus::Completed),
            "partial" => Ok(RunStatus::Partial),
            "failed" => Ok(RunStatus::Failed),
            _ => Err(format!("Invalid run status '{}'", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunTrigger {
    Manual,
    Automatic,
}

impl RunTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunTrigger::Manual => "manual",
            RunTrigger::Automatic => "automatic",
        }
    }
}

impl fmt::Display for RunTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunTrigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(RunTrigger::Manual),
            "automatic" => Ok(RunTrigger::Automatic),
            _ => Err(format!("Invalid run trigger '{}'", s)),
        }
    }
}

/// What a run covered. Only a full run marks every record of the tenant,
/// so only a full run can serve as the reference for an orphan sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunScope {
    #[default]
    Full,
    Case,
}

impl RunScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunScope::Full => "full",
            RunScope::Case => "case",
        }
    }
}

impl fmt::Display for RunScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(RunScope::Full),
            "case" => Ok(RunScope::Case),
            _ => Err(format!("Invalid run scope '{}'", s)),
        }
    }
}

/// Persisted log of one sync execution.
///
/// Written once when the lock is acquired and once more when the run is
/// finalized. Finalized rows are never rewritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRun {
    pub session_id: SessionId,
    pub tenant: TenantToken,
    pub trigger: RunTrigger,
    #[serde(default)]
    pub scope: RunScope,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub items_processed: u64,
    pub items_failed: u64,
    pub error_summary: Vec<String>,
}

impl SyncRun {
    pub fn started(session_id: SessionId, tenant: TenantToken, trigger: RunTrigger) -> Self {
        Self {
            session_id,
            tenant,
            trigger,
            scope: RunScope::Full,
            status: RunStatus::Started,
            started_at: Utc::now(),
            ended_at: None,
            items_processed: 0,
            items_failed: 0,
            error_summary: Vec::new(),
        }
    }

    pub fn with_scope(mut self, scope: RunScope) -> Self {
        self.scope = scope;
        self
    }

    /// Whether this run finished a mark phase over the whole catalog.
    pub fn is_sweep_reference(&self) -> bool {
        self.scope == RunScope::Full
            && matches!(self.status, RunStatus::Completed | RunStatus::Partial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_round_trip_through_str() {
        for status in [
            RunStatus::Started,
            RunStatus::Completed,
            RunStatus::Partial,
            RunStatus::Failed,
        ] {
            assert_eq!(RunStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(RunStatus::from_str("running").is_err());
    }

    #[test]
    fn test_started_run_is_not_final() {
        let run = SyncRun::started(
            SessionId::new("1"),
            TenantToken::new("acme"),
            RunTrigger::Manual,
        );
        assert!(!run.status.is_final());
        assert!(run.ended_at.is_none());
        assert_eq!(run.items_processed, 0);
    }

    #[test]
    fn test_only_finished_full_runs_are_sweep_references() {
        let mut run = SyncRun::started(
            SessionId::new("1"),
            TenantToken::new("acme"),
            RunTrigger::Manual,
        );
        assert_eq!(run.scope, RunScope::Full);
        assert!(!run.is_sweep_reference());

        run.status = RunStatus::Partial;
        assert!(run.is_sweep_reference());

        run.status = RunStatus::Failed;
        assert!(!run.is_sweep_reference());

        let refresh = SyncRun {
            status: RunStatus::Completed,
            ..run.with_scope(RunScope::Case)
        };
        assert!(!refresh.is_sweep_reference());
        assert_eq!("case".parse::<RunScope>().unwrap(), RunScope::Case);
    }
}
