//! setkeeper set controller
//!
//! Reads threat feeds from a directory and keeps one network set per feed in
//! the cluster API and one IP set per feed in the search backend.
//!
//! ## Architecture
//!
//! - **Feed producer**: Scans the feeds directory and declares desired sets
//! - **Network-set controller**: Watches the cluster API and converges it
//! - **IP-set controller**: Re-lists the search backend and converges it
//! - **Status reporter**: Logs per-feed error conditions and counters

use std::time::Duration;

use anyhow::Result;
use setkeeper_set_controller::{config, Daemon};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How long tasks get to stop after shutdown is signalled.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting setkeeper set controller");
    info!(
        cluster_api_url = %config.cluster_api_url,
        elastic_url = %config.elastic_url,
        cluster_name = %config.cluster_name,
        feeds_dir = %config.feeds_dir.display(),
        max_attempts = config.max_attempts,
        "Configuration loaded"
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut daemon = Daemon::start(&config, shutdown_rx)?;

    // Wait for shutdown signal
    let mut failure = None;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        exited = daemon.next_exit() => {
            match exited {
                Some((task, Ok(()))) => warn!(task, "Task exited unexpectedly"),
                Some((task, Err(e))) => {
                    error!(task, error = %e, "Task failed");
                    failure = Some(e.context(task));
                }
                None => warn!("No tasks running"),
            }
        }
    }

    // Signal shutdown to all tasks
    let _ = shutdown_tx.send(true);

    info!("Waiting for tasks to shut down...");
    match tokio::time::timeout(SHUTDOWN_GRACE, daemon.wait()).await {
        Ok(Ok(())) => info!("Set controller shutdown complete"),
        Ok(Err(e)) => {
            error!(error = %e, "Set controller stopped with errors");
            return Err(e);
        }
        Err(_) => warn!(
            grace_secs = SHUTDOWN_GRACE.as_secs(),
            "Tasks did not stop in time"
        ),
    }

    failure.map_or(Ok(()), Err)
}
