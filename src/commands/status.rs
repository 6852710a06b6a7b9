use chrono::Utc;
use clap::Args;
use mirror_core::{AuditLog, LockRecord, SyncLock, SyncRun, TenantToken};
use serde::Serialize;
use std::collections::BTreeMap;

use super::{OutputFormat, Stores};
use crate::config::Config;

/// Show the lock holder, mirrored counts and recent runs
#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Number of recent runs to show
    #[arg(long, short, default_value = "5")]
    limit: usize,

    /// Output format
    #[arg(long, short, value_enum, default_value = "text")]
    format: OutputFormat,
}

#[derive(Debug, Serialize)]
struct StatusReport {
    tenant: TenantToken,
    lock: Option<LockRecord>,
    lock_stale: bool,
    counts: BTreeMap<String, i64>,
    runs: Vec<SyncRun>,
}

impl StatusCommand {
    pub async fn run(
        &self,
        stores: &Stores,
        config: &Config,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let tenant = config.tenant_token();
        let lock = SyncLock::new(stores.locks.clone()).holder(&tenant).await?;
        let counts = stores
            .mirror
            .counts_by_kind(&tenant)
            .await?
            .into_iter()
            .map(|(kind, count)| (kind.to_string(), count))
            .collect();
        let runs = stores.audit.recent_runs(&tenant, self.limit).await?;

        let report = StatusReport {
            lock_stale: lock
                .as_ref()
                .map_or(false, |l| l.is_stale_at(Utc::now())),
            tenant,
            lock,
            counts,
            runs,
        };

        match self.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            OutputFormat::Text => print!("{}", render_text(&report)),
        }
        Ok(())
    }
}

fn render_text(report: &StatusReport) -> String {
    let mut out = format!("Tenant: {}\n\n", report.tenant);

    match &report.lock {
        Some(lock) => out.push_str(&format!(
            "Lock: held since {} (ttl {}s{})\n",
            lock.acquired_at.format("%Y-%m-%d %H:%M:%S"),
            lock.ttl_secs,
            if report.lock_stale { ", stale" } else { "" }
        )),
        None => out.push_str("Lock: free\n"),
    }
    out.push('\n');

    out.push_str("Mirrored entities\n");
    if report.counts.is_empty() {
        out.push_str("  (none)\n");
    }
    for (kind, count) in &report.counts {
        out.push_str(&format!("  {:<10} {}\n", kind, count));
    }
    out.push('\n');

    out.push_str("Recent runs\n");
    if report.runs.is_empty() {
        out.push_str("  (none)\n");
    }
    for run in &report.runs {
        out.push_str(&format!(
            "  {}  {:<9} {:<9} {:<4} processed {}, failed {}  [{}]\n",
            run.started_at.format("%Y-%m-%d %H:%M"),
            run.status.as_str(),
            run.trigger.as_str(),
            run.scope.as_str(),
            run.items_processed,
            run.items_failed,
            run.session_id
        ));
        for line in &run.error_summary {
            out.push_str(&format!("      {}\n", line));
        }
    }
    out
}
