use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use covglobe_storage::{MemoryRecordStore, PgRecordStore, RecordStore};
use covglobe_sync::{build_scheduler, BatchOutcome, IngestionPipeline, SyncConfig};
use covglobe_web::AppState;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "covglobe-cli")]
#[command(about = "COVID-19 daily report ingestion and API")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion batch.
    Sync {
        /// Ingest into an in-memory store instead of Postgres.
        #[arg(long)]
        dry_run: bool,
    },
    /// Run ingestion batches on the configured cron until Ctrl-C.
    Schedule,
    /// Serve the read API.
    Serve,
    /// Apply database migrations.
    Migrate,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn open_store(config: &SyncConfig) -> Result<Arc<PgRecordStore>> {
    let store = PgRecordStore::connect(&config.database_url)
        .await
        .context("connecting to DATABASE_URL")?;
    store.migrate().await.context("applying migrations")?;
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_logging();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { dry_run: false }) {
        Commands::Sync { dry_run } => {
            let store: Arc<dyn RecordStore> = if dry_run {
                Arc::new(MemoryRecordStore::new())
            } else {
                open_store(&config).await?
            };
            let pipeline = IngestionPipeline::from_config(&config, store)?;
            match pipeline.run_once().await {
                BatchOutcome::Completed { summary, .. } => {
                    println!("{}", serde_json::to_string_pretty(&summary)?);
                }
                BatchOutcome::Aborted { run_id, reason } => {
                    bail!("sync run {run_id} aborted: {reason}");
                }
                BatchOutcome::AlreadyRunning => warn!("sync already running"),
            }
        }
        Commands::Schedule => {
            let store = open_store(&config).await?;
            let pipeline = Arc::new(IngestionPipeline::from_config(&config, store)?);
            let mut sched = build_scheduler(pipeline, config.ingest_cron.clone()).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.ingest_cron, "scheduler running; Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Serve => {
            let store = open_store(&config).await?;
            let _sched = if config.scheduler_enabled {
                let pipeline = Arc::new(IngestionPipeline::from_config(&config, store.clone())?);
                let sched = build_scheduler(pipeline, config.ingest_cron.clone()).await?;
                sched.start().await.context("starting scheduler")?;
                info!(cron = %config.ingest_cron, "scheduler running alongside API");
                Some(sched)
            } else {
                None
            };
            covglobe_web::serve(covglobe_web::port_from_env(), AppState::new(store)).await?;
        }
        Commands::Migrate => {
            open_store(&config).await?;
            info!("migrations applied");
        }
    }

    Ok(())
}
