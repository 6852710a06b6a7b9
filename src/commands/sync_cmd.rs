//! Sync CLI commands for mirroring the upstream catalog.

use clap::{Args, Subcommand};
use mirror_core::{Orchestrator, RunHandle, RunSnapshot, RunStatus, RunTrigger, SyncError};

use super::Stores;
use crate::config::Config;
use crate::source::HttpSourceError;

/// Mirror the catalog into the local database
#[derive(Debug, Args)]
pub struct SyncCommand {
    #[command(subcommand)]
    command: Option<SyncSubcommand>,

    /// Rewrite every record even when unchanged
    #[arg(long)]
    force: bool,

    /// Attach case photos after the case stage
    #[arg(long)]
    media: bool,

    /// Count orphans but leave them for review
    #[arg(long)]
    keep_orphans: bool,
}

#[derive(Debug, Subcommand)]
enum SyncSubcommand {
    /// Re-sync a single case by its catalog id
    Case {
        /// Catalog id of the case
        external_id: String,
    },
}

impl SyncCommand {
    pub async fn run(&self, stores: &Stores, config: &Config) -> Result<(), SyncCommandError> {
        let mut options = config.sync.to_options();
        if self.force {
            options.force_update = true;
        }
        if self.media {
            options.sync_media = true;
        }
        if self.keep_orphans {
            options.auto_delete_orphans = false;
        }

        let orchestrator = stores.orchestrator(config, options)?;
        let tenant = config.tenant_token();

        let mut handle = match &self.command {
            None => orchestrator.start_run(tenant, RunTrigger::Manual).await?,
            Some(SyncSubcommand::Case { external_id }) => {
                orchestrator.start_case_refresh(tenant, external_id).await?
            }
        };

        println!(
            "Sync run {} started for tenant '{}'",
            handle.session_id(),
            handle.tenant()
        );
        println!();

        let snapshot = follow(&orchestrator, &mut handle).await;
        println!();
        print!("{}", summary(&snapshot));

        match snapshot.status {
            RunStatus::Failed => Err(SyncCommandError::RunFailed(
                snapshot
                    .failure
                    .unwrap_or_else(|| "unknown failure".to_string()),
            )),
            _ => Ok(()),
        }
    }
}

/// Prints progress until the run finishes. The first Ctrl-C requests
/// cancellation; the run still finalizes normally.
async fn follow(orchestrator: &Orchestrator, handle: &mut RunHandle) -> RunSnapshot {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut cancel_requested = false;
    let mut last_line = String::new();

    loop {
        let changed = tokio::select! {
            more = handle.changed() => Some(more),
            _ = &mut ctrl_c, if !cancel_requested => None,
        };

        match changed {
            None => {
                println!("Cancelling after the current record...");
                orchestrator.cancel_run(handle);
                cancel_requested = true;
            }
            Some(false) => break,
            Some(true) => match orchestrator.get_progress(handle) {
                Some(progress) => {
                    let stage = progress.stage.map_or("sweep", |s| s.as_str());
                    let line = format!("  [{:>3}%] {}", progress.percent, stage);
                    if line != last_line {
                        println!("{}", line);
                        last_line = line;
                    }
                }
                None => break,
            },
        }
    }

    handle.wait().await
}

fn summary(snapshot: &RunSnapshot) -> String {
    let mut out = format!(
        "Sync run {}: {}\n",
        snapshot.session_id, snapshot.status
    );
    out.push_str(&format!(
        "  processed: {} (created {}, updated {}, unchanged {})\n",
        snapshot.items_processed, snapshot.created, snapshot.updated, snapshot.unchanged
    ));
    out.push_str(&format!("  failed:    {}\n", snapshot.items_failed));

    let found: usize = snapshot.orphans_found.values().sum();
    if found > 0 {
        let by_kind: Vec<String> = snapshot
            .orphans_found
            .iter()
            .map(|(kind, count)| format!("{}: {}", kind, count))
            .collect();
        out.push_str(&format!(
            "  orphans:   found {} ({}), deleted {}\n",
            found,
            by_kind.join(", "),
            snapshot.orphans_deleted
        ));
    }

    let errors = snapshot.progress.errors.len();
    let warnings = snapshot.progress.warnings.len();
    if errors > 0 || warnings > 0 {
        out.push_str(&format!(
            "  {} error(s), {} warning(s); see `catalog-mirror status` for details\n",
            errors, warnings
        ));
    }
    if let Some(reason) = &snapshot.failure {
        out.push_str(&format!("  reason:    {}\n", reason));
    }
    out
}

/// Errors from sync commands
#[derive(Debug)]
pub enum SyncCommandError {
    Source(HttpSourceError),
    Sync(SyncError),
    RunFailed(String),
}

impl std::fmt::Display for SyncCommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncCommandError::Source(e) => write!(f, "{}", e),
            SyncCommandError::Sync(e) => write!(f, "{}", e),
            SyncCommandError::RunFailed(reason) => write!(f, "Sync run failed: {}", reason),
        }
    }
}

impl std::error::Error for SyncCommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SyncCommandError::Source(e) => Some(e),
            SyncCommandError::Sync(e) => Some(e),
            SyncCommandError::RunFailed(_) => None,
        }
    }
}

impl From<HttpSourceError> for SyncCommandError {
    fn from(e: HttpSourceError) -> Self {
        SyncCommandError::Source(e)
    }
}

impl From<SyncError> for SyncCommandError {
    fn from(e: SyncError) -> Self {
        SyncCommandError::Sync(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirror_core::{RecordKind, SessionId, SyncRun, TenantToken};

    fn finished(status: RunStatus) -> RunSnapshot {
        let run = SyncRun::started(
            SessionId::new("s-1"),
            TenantToken::new("acme"),
            RunTrigger::Manual,
        );
        let mut snapshot = RunSnapshot::started(&run);
        snapshot.status = status;
        snapshot
    }

    #[test]
    fn test_summary_counts() {
        let mut snapshot = finished(RunStatus::Completed);
        snapshot.items_processed = 12;
        snapshot.created = 2;
        snapshot.updated = 1;
        snapshot.unchanged = 9;

        let text = summary(&snapshot);

        assert!(text.starts_with("Sync run s-1: completed\n"));
        assert!(text.contains("processed: 12 (created 2, updated 1, unchanged 9)"));
        assert!(!text.contains("orphans"));
        assert!(!text.contains("reason"));
    }

    #[test]
    fn test_summary_reports_orphans_and_problems() {
        let mut snapshot = finished(RunStatus::Partial);
        snapshot.orphans_found.insert(RecordKind::Case, 2);
        snapshot.orphans_deleted = 2;
        snapshot.items_failed = 1;
        snapshot.progress.errors = vec!["case '7': missing external id".to_string()];

        let text = summary(&snapshot);

        assert!(text.contains("orphans:   found 2 (case: 2), deleted 2"));
        assert!(text.contains("1 error(s), 0 warning(s)"));
        // Raw error text stays in the run log
        assert!(!text.contains("missing external id"));
    }

    #[test]
    fn test_summary_shows_failure_reason() {
        let mut snapshot = finished(RunStatus::Failed);
        snapshot.failure = Some("cancelled".to_string());

        assert!(summary(&snapshot).contains("reason:    cancelled"));
    }

    #[test]
    fn test_run_failed_message() {
        let err = SyncCommandError::RunFailed("cancelled".to_string());
        assert_eq!(err.to_string(), "Sync run failed: cancelled");
    }
}
