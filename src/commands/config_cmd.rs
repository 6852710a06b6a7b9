use clap::{Args, Subcommand};

use super::OutputFormat;
use crate::config::Config;

#[derive(Args)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub command: Option<ConfigSubcommand>,
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Show current configuration values
    Show {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

impl ConfigCommand {
    pub fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        let format = match &self.command {
            Some(ConfigSubcommand::Show { format }) => format.clone(),
            None => OutputFormat::Text,
        };

        match format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(config)?);
            }
            OutputFormat::Text => print!("{}", render_text(config)),
        }
        Ok(())
    }
}

fn render_text(config: &Config) -> String {
    let mut out = String::new();
    out.push_str("Configuration\n");
    out.push_str("=============\n\n");

    match &config.config_file {
        Some(path) => out.push_str(&format!("Config file: {}\n\n", path.display())),
        None => out.push_str(&format!(
            "Config file: {} (not found)\n\n",
            Config::default_config_path().display()
        )),
    }

    out.push_str(&format!(
        "database_path: {}\n  source: {}\n\n",
        config.database_path.value.display(),
        config.database_path.source
    ));
    out.push_str(&format!(
        "tenant: {}\n  source: {}\n\n",
        config.tenant.value, config.tenant.source
    ));

    out.push_str("source:\n");
    out.push_str(&format!(
        "  base_url: {}\n",
        config.source.base_url.as_deref().unwrap_or("(not set)")
    ));
    out.push_str(&format!(
        "  api_token: {}\n",
        if config.source.api_token.is_some() {
            "(set)"
        } else {
            "(not set)"
        }
    ));
    out.push_str(&format!("  timeout_secs: {}\n\n", config.source.timeout_secs));

    let sync = &config.sync;
    out.push_str("sync:\n");
    out.push_str(&format!("  page_size: {}\n", sync.page_size));
    out.push_str(&format!("  page_delay_ms: {}\n", sync.page_delay_ms));
    out.push_str(&format!("  lock_ttl_secs: {}\n", sync.lock_ttl_secs));
    out.push_str(&format!("  force_update: {}\n", sync.force_update));
    out.push_str(&format!("  sync_media: {}\n", sync.sync_media));
    out.push_str(&format!("  auto_delete_orphans: {}\n", sync.auto_delete_orphans));
    out.push_str(&format!("  stamp_retries: {}\n", sync.stamp_retries));
    out
}
