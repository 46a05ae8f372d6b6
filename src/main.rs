//! Entry point for the Fleet Payroll binary.
//!
//! Running this binary starts the payroll worker pool and an HTTP
//! server for triggering monthly payroll and inspecting the queue.
//! Settings come from `PAYROLL_*` environment variables (a `.env` file
//! is honoured).  Payroll data and queued jobs live in the SQLite
//! database at `PAYROLL_DATABASE_PATH`; `PAYROLL_DATA_FILE` may point
//! at a JSON file of organisations, drivers, providers, vehicles and
//! attendance to load into it at startup.

use anyhow::Context;
use fleet_payroll::api::{self, AppState};
use fleet_payroll::config::Config;
use fleet_payroll::handler::PayrollJobHandler;
use fleet_payroll::job::OrganizationPayrollJob;
use fleet_payroll::queue::{JobQueue, WorkerPool};
use fleet_payroll::store::{PayrollStore, SeedData, SqliteStore};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Loaded first so RUST_LOG from .env reaches the filter.
    let dotenv = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fleet_payroll=info".into()),
        )
        .init();

    if let Err(e) = dotenv {
        info!("No .env file loaded: {}", e);
    }

    if let Err(err) = run().await {
        error!("Error running payroll service: {:#}", err);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let sqlite = SqliteStore::from_path(&config.database_path)
        .await
        .with_context(|| format!("opening database {}", config.database_path.display()))?;
    if let Some(path) = &config.data_file {
        let seed = SeedData::from_file(path)
            .with_context(|| format!("loading seed data from {}", path.display()))?;
        sqlite.load_seed(&seed).await?;
    }
    let store: Arc<dyn PayrollStore> = Arc::new(sqlite.clone());

    let queue = JobQueue::open(config.queue.clone(), Arc::new(sqlite)).await?;
    let handler = PayrollJobHandler::new(
        store.clone(),
        queue.clone(),
        OrganizationPayrollJob::new(store.clone(), config.utc_offset),
    );
    let mut workers = WorkerPool::new(queue.clone(), Arc::new(handler), config.worker);
    workers.start();

    let state = Arc::new(AppState {
        queue: queue.clone(),
    });
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
        info!("Shutdown signal received");
    };
    let served = api::serve(config.bind_addr, state, shutdown).await;

    queue.close().await;
    workers.stop().await;
    served
}
