use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use nrega_core::SyncStatus;
use nrega_storage::{PgStore, RunLedger};
use nrega_sync::{build_scheduler, pipeline_from_config, ScheduleCursor, SyncConfig, SyncRequest};
use tracing::info;
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "nrega-cli")]
#[command(about = "MGNREGA district statistics sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Default, clap::Args)]
struct SyncArgs {
    /// Window of states to process, counted in chunks of `--chunk-size`.
    #[arg(long)]
    chunk_index: Option<usize>,
    #[arg(long)]
    chunk_size: Option<usize>,
    /// States processed in parallel within the window.
    #[arg(long)]
    concurrency: Option<usize>,
    /// Fiscal year such as 2024-2025; repeatable. Defaults to the current one.
    #[arg(long = "period")]
    periods: Vec<String>,
}

impl SyncArgs {
    fn into_request(self) -> SyncRequest {
        SyncRequest {
            chunk_index: self.chunk_index,
            chunk_size: self.chunk_size,
            concurrency: self.concurrency,
            periods: self.periods,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one chunk of the sync and print its summary.
    Sync(SyncArgs),
    Migrate,
    Serve,
    /// Run chunks on the configured cron schedule until interrupted.
    Schedule(SyncArgs),
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

fn init_tracing(default_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {}", e))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("info,sqlx=warn")?;
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => {
            let summary = nrega_sync::run_sync_once_from_env(args.into_request()).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if summary.status == SyncStatus::Error {
                anyhow::bail!(
                    "sync run {} failed: {}",
                    summary.run_id,
                    summary.error.unwrap_or_default()
                );
            }
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = PgStore::connect(&config.database_url, config.pool_settings()).await?;
            store.migrate().await?;
            info!("migrations applied");
        }
        Commands::Serve => {
            nrega_web::serve_from_env().await?;
        }
        Commands::Schedule(args) => {
            let pipeline = Arc::new(pipeline_from_config(SyncConfig::from_env())?);
            let cron = pipeline.config().scheduler_cron.clone();
            let cursor = Arc::new(ScheduleCursor::default());
            let sched = build_scheduler(pipeline, cursor, args.into_request()).await?;
            sched.start().await?;
            info!(%cron, "scheduler started; ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
            info!("shutting down scheduler");
        }
        Commands::Runs { limit } => {
            let config = SyncConfig::from_env();
            let store = PgStore::connect(&config.database_url, config.pool_settings()).await?;
            let runs = store.recent(limit).await?;
            println!("{}", serde_json::to_string_pretty(&runs)?);
        }
    }

    Ok(())
}
