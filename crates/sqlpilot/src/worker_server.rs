//! Long-running dispatch consumer process.

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::shared_state::CoreServices;

/// Run the dispatch worker until Ctrl-C, then drain in-flight turns.
pub async fn run_worker_server(cfg: Config) -> anyhow::Result<()> {
    crate::telemetry::init_tracing();
    crate::metrics::init_metrics();
    cfg.print_config();

    let services = CoreServices::from_config(&cfg)?;
    let worker = services.worker();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                // dropping the sender would stop the worker
                warn!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        }
    });

    let stats = worker.run(shutdown_rx).await?;
    info!(
        "Worker exited after {} turns ({} processed, {} failed)",
        stats.received, stats.processed, stats.failed
    );
    debug!("Final metrics:\n{}", crate::metrics::gather_text());
    Ok(())
}
