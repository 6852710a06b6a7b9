use clap::{Args, Subcommand};
use mirror_core::{OrphanCandidate, OrphanReconciler, RecordKind, SessionId};
use std::io::{self, Write};

use super::{OutputFormat, Stores};
use crate::config::Config;

/// Review and remove entities that vanished upstream
#[derive(Debug, Args)]
pub struct OrphansCommand {
    #[command(subcommand)]
    command: OrphansSubcommand,
}

#[derive(Debug, Subcommand)]
enum OrphansSubcommand {
    /// List entities not seen by a sync session
    List {
        /// Session id of the reference run
        #[arg(long, short)]
        session: String,

        /// Only this kind (category, procedure, case)
        #[arg(long, short)]
        kind: Option<RecordKind>,

        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Delete entities not seen by a sync session
    Delete {
        /// Session id of the reference run
        #[arg(long, short)]
        session: String,

        /// Only this kind (category, procedure, case)
        #[arg(long, short)]
        kind: Option<RecordKind>,

        /// Skip confirmation prompt
        #[arg(long, short)]
        force: bool,
    },
}

impl OrphansCommand {
    pub async fn run(
        &self,
        stores: &Stores,
        config: &Config,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let tenant = config.tenant_token();

        match &self.command {
            OrphansSubcommand::List {
                session,
                kind,
                format,
            } => {
                let session = parse_session(session)?;
                let reconciler = OrphanReconciler::new(stores.mirror.clone(), stores.audit.clone());
                let candidates = reconciler.review_orphans(&session, &tenant, *kind).await?;

                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&candidates)?);
                    }
                    OutputFormat::Text => print!("{}", render_list(&candidates)),
                }
                Ok(())
            }
            OrphansSubcommand::Delete {
                session,
                kind,
                force,
            } => {
                let session = parse_session(session)?;
                let orchestrator = stores.orchestrator(config, config.sync.to_options())?;
                let candidates = orchestrator.list_orphans(&session, &tenant, *kind).await?;

                if candidates.is_empty() {
                    println!("No orphans found.");
                    return Ok(());
                }

                print!("{}", render_list(&candidates));

                // Confirm deletion unless --force is used
                if !force {
                    print!("Delete {} orphan(s)? [y/N] ", candidates.len());
                    io::stdout().flush()?;

                    let mut input = String::new();
                    io::stdin().read_line(&mut input)?;

                    if !input.trim().eq_ignore_ascii_case("y") {
                        println!("Deletion cancelled.");
                        return Ok(());
                    }
                }

                let outcome = orchestrator.delete_orphans(&candidates, &session).await?;
                println!("Deleted {} orphan(s).", outcome.deleted.len());
                if outcome.skipped > 0 {
                    println!("Skipped {} changed since listing.", outcome.skipped);
                }
                if !outcome.audit_failures.is_empty() {
                    println!(
                        "Warning: {} deletion(s) could not be audited.",
                        outcome.audit_failures.len()
                    );
                }
                if !outcome.errors.is_empty() {
                    return Err(format!(
                        "{} orphan(s) could not be deleted",
                        outcome.errors.len()
                    )
                    .into());
                }
                Ok(())
            }
        }
    }
}

fn parse_session(session: &str) -> Result<SessionId, String> {
    let session = session.trim();
    if session.is_empty() {
        return Err("Session id must not be empty".to_string());
    }
    Ok(SessionId::new(session))
}

fn render_list(candidates: &[OrphanCandidate]) -> String {
    if candidates.is_empty() {
        return "No orphans found.\n".to_string();
    }

    let mut out = String::new();
    for candidate in candidates {
        let entry = &candidate.entry;
        out.push_str(&format!(
            "  {:<10} {:<12} {}  (last seen {})\n",
            entry.kind.as_str(),
            entry.external_id,
            candidate.display_name,
            entry.last_sync_session_id
        ));
    }

    let report = OrphanReconciler::report(candidates);
    let by_kind: Vec<String> = report
        .by_kind
        .iter()
        .map(|(kind, count)| format!("{}: {}", kind, count))
        .collect();
    out.push_str(&format!(
        "\n{} orphan(s) ({})\n",
        report.total(),
        by_kind.join(", ")
    ));
    out
}
