use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod config;
mod db;
mod source;

use commands::{ConfigCommand, OrphansCommand, StatusCommand, Stores, SyncCommand};
use config::Config;
use db::init_db;

#[derive(Parser)]
#[command(name = "catalog-mirror")]
#[command(version)]
#[command(about = "Mirror a remote clinical catalog into a local database", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a sync against the catalog API
    Sync(SyncCommand),

    /// Show lock, mirror counts and recent runs
    Status(StatusCommand),

    /// Review or delete orphaned entities
    Orphans(OrphansCommand),

    /// Manage configuration
    Config(ConfigCommand),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "catalog_mirror=info,mirror_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config)?;

    match cli.command {
        Some(Commands::Sync(cmd)) => {
            let stores = open_stores(&config).await?;
            cmd.run(&stores, &config).await?;
        }
        Some(Commands::Status(cmd)) => {
            let stores = open_stores(&config).await?;
            cmd.run(&stores, &config).await?;
        }
        Some(Commands::Orphans(cmd)) => {
            let stores = open_stores(&config).await?;
            cmd.run(&stores, &config).await?;
        }
        Some(Commands::Config(cmd)) => {
            cmd.run(&config)?;
        }
        None => {
            println!("Use --help to see available commands");
        }
    }

    Ok(())
}

async fn open_stores(config: &Config) -> Result<Stores, sqlx::Error> {
    let pool = init_db(&config.database_path.value).await?;
    Ok(Stores::new(pool))
}
