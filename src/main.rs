use std::sync::Arc;

use thiserror::Error;

use crate::cycle::{Collector, CycleError, CycleSettings};
use crate::db::prelude::*;
use crate::util::chatters::TmiClient;
use crate::util::env::{Config, EnvErr};
use crate::util::helix::{HelixClient, HelixErr};
use crate::util::telemetry;

mod args;
mod cycle;
mod db;
mod overlap;
mod util;

#[derive(Debug, Error)]
enum RunnerErr {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Std(#[from] Box<dyn std::error::Error>),

    #[error(transparent)]
    Env(#[from] EnvErr),

    #[error(transparent)]
    Helix(#[from] HelixErr),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cycle(#[from] CycleError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("DATABASE_URL must be set unless running with --dry-run")]
    MissingDatabaseUrl,
}

type Result<T> = core::result::Result<T, RunnerErr>;

#[tokio::main]
async fn main() -> Result<()> {
    let args = args::parse_cli_args();
    let config = Config::from_env(args.env_file.as_deref())?;
    let telemetry_registry = telemetry::Telemetry::new(&config, args.json_logs)?.register();

    tracing::info!(?args, "starting collector");

    let outcome = run(&args, &config).await;
    if let Err(e) = &outcome {
        tracing::error!(error = %e, "collector exited with error");
    }

    telemetry_registry.shutdown();
    outcome
}

async fn run(args: &args::Cli, config: &Config) -> Result<()> {
    let directory = Arc::new(HelixClient::new(config)?);
    let chatters = Arc::new(TmiClient::new(config));

    let memory = Arc::new(MemoryStore::new());
    let store: Arc<dyn OverlapStore> = if args.dry_run {
        tracing::warn!("dry run, results are kept in memory only");
        memory.clone()
    } else {
        let database_url = config
            .database_url
            .as_deref()
            .ok_or(RunnerErr::MissingDatabaseUrl)?;
        Arc::new(PgOverlapStore::new(db::connect(database_url).await?))
    };

    let collector = Collector::new(directory, chatters, store, CycleSettings::new(config));

    if args.once {
        let report = collector.run_cycle().await?;
        tracing::info!(?report, "cycle complete");

        if args.dry_run {
            let state = memory.snapshot().await;
            let channels: Vec<_> = state.channels.values().collect();
            println!("{}", serde_json::to_string_pretty(&channels)?);
        }

        return Ok(());
    }

    collector
        .run_scheduled(config.cycle_interval(), tokio::signal::ctrl_c())
        .await?;
    tracing::info!("shutdown requested");

    Ok(())
}
