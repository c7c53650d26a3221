use std::sync::Arc;

use neona::audit::PdrWriter;
use neona::config::Config;
use neona::connectors::LocalExec;
use neona::scheduler::Scheduler;
use neona::store::Store;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = Config::from_env();
    info!(db = %config.db_path.display(), "Starting neonad");

    let store = Arc::new(Store::open(&config.db_path)?);
    let pdr = PdrWriter::new(Arc::clone(&store));

    let work_dir = std::env::current_dir()?;
    let connector: Arc<LocalExec> = Arc::new(
        LocalExec::new()
            .with_allowlist(config.allowlist.clone())
            .with_work_dir(work_dir),
    );

    let scheduler = Scheduler::new(
        Arc::clone(&store),
        pdr,
        connector,
        config.scheduler.clone(),
    );
    scheduler.start()?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, draining workers");
    if let Err(e) = scheduler.stop().await {
        error!(error = %e, "Scheduler shutdown failed");
    }

    Ok(())
}
