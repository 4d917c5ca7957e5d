use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use roster_sync::{RosterConfig, RunMode, RunOptions, RunOutcome, SyncRunSummary};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "roster-cli")]
#[command(about = "Reconciles the source activity log into the working-set table")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Compute the write plan without touching the target table.
    #[arg(long, global = true)]
    dry_run: bool,

    /// Policy file; overrides ROSTER_POLICY_PATH.
    #[arg(long, global = true)]
    policy: Option<PathBuf>,

    /// Print the run summary as JSON.
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum Commands {
    /// Evict, refresh, admit and sweep.
    Sync,
    /// Refresh existing rows only.
    Refresh,
    /// Admit new keys only.
    Admit,
}

impl From<Commands> for RunMode {
    fn from(command: Commands) -> Self {
        match command {
            Commands::Sync => RunMode::Full,
            Commands::Refresh => RunMode::RefreshOnly,
            Commands::Admit => RunMode::AdmitOnly,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = RosterConfig::from_env();
    if let Some(path) = cli.policy {
        config.policy_path = path;
    }
    let options = RunOptions {
        mode: cli.command.unwrap_or(Commands::Sync).into(),
        dry_run: cli.dry_run,
    };

    let summary = roster_sync::run_sync_once(config, options).await?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{}", summary_line(&summary));
    }
    Ok(())
}

fn summary_line(summary: &SyncRunSummary) -> String {
    if summary.outcome == RunOutcome::NoSource {
        return format!("sync skipped: run_id={} source log is empty", summary.run_id);
    }
    format!(
        "sync complete: run_id={} mode={} dry_run={} admitted={}/{} evicted={} cells_touched={} cells_written={} cleared={} markers_cleared={}",
        summary.run_id,
        summary.mode.as_str(),
        summary.dry_run,
        summary.keys_admitted,
        summary.rows_admitted,
        summary.rows_evicted,
        summary.cells_touched,
        summary.cells_written,
        summary.rows_cleared,
        summary.markers_cleared,
    )
}
