use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ranksync_storage::PgAthleteStore;
use ranksync_sync::{maybe_build_scheduler, run_sync_once, SyncConfig};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ranksync-cli")]
#[command(about = "Delta sync of ranked athletes into Postgres")]
struct Cli {
    /// Debug-level logging (overrides RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile every enabled category once
    Sync {
        /// Fetch and compare but write nothing to the database
        #[arg(long)]
        dry_run: bool,
        /// Where to write the run stats JSON
        #[arg(long)]
        stats_file: Option<PathBuf>,
    },
    /// Apply pending schema migrations
    Migrate,
    /// Reconcile on the SYNC_CRON schedule until interrupted
    Schedule,
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let mut config = SyncConfig::from_env();

    let command = cli.command.unwrap_or(Commands::Sync {
        dry_run: false,
        stats_file: None,
    });
    match command {
        Commands::Sync {
            dry_run,
            stats_file,
        } => {
            config.dry_run = dry_run;
            if let Some(path) = stats_file {
                config.stats_file = path;
            }
            let summary = run_sync_once(&config).await?;
            println!(
                "sync {}: new={} updated={} unchanged={} dropped={} fetch_errors={} db_errors={} stats={}",
                if summary.success { "complete" } else { "finished with errors" },
                summary.new_athletes,
                summary.updated_athletes,
                summary.unchanged_athletes,
                summary.dropped_athletes,
                summary.fetch_errors,
                summary.db_errors,
                config.stats_file.display()
            );
            if !summary.success {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Migrate => {
            let store = PgAthleteStore::connect(&config.database_url, 1)
                .await
                .context("connecting to database")?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            let mut sched = maybe_build_scheduler(&config)
                .await?
                .context("scheduler disabled; set RANKSYNC_SCHEDULER_ENABLED=1")?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler running, ctrl-c to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(ExitCode::SUCCESS)
}
