use std::sync::Arc;

use anyhow::Context;
use jobstore::config::{StoreConfig, SweeperConfig};
use jobstore::error::TracingReporter;
use jobstore::jobs::JobStatus;
use jobstore::store::{BackgroundJobRepository, ConnectionPool};
use jobstore::sweeper::JobSweeper;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let store_config = StoreConfig::from_env().context("Invalid store configuration")?;
    let sweeper_config = SweeperConfig::from_env().context("Invalid sweeper configuration")?;

    // Initialize tracing: stderr plus a daily log file next to the database
    let file_appender =
        tracing_appender::rolling::daily(store_config.data_dir.join("logs"), "jobstore.log");
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    eprintln!("🗂  Jobstore v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", store_config.paths().db_file.display());
    eprintln!(
        "   Sweep every {}s, stale after {}s, keep {} days\n",
        sweeper_config.interval.as_secs(),
        sweeper_config.stale_threshold.as_secs(),
        sweeper_config.days_to_keep
    );

    // ── Store ───────────────────────────────────────────────────────────
    let pool = ConnectionPool::open(store_config, Arc::new(TracingReporter))
        .await
        .context("Failed to open job store")?;
    let repo = Arc::new(BackgroundJobRepository::new(Arc::new(pool)));

    let active = repo
        .get_active_background_jobs(jobstore::jobs::PayloadMode::ExcludeResponse)
        .await;
    let claimed = active
        .iter()
        .filter(|j| j.status == JobStatus::AcknowledgedByWorker)
        .count();
    tracing::info!(active = active.len(), claimed, "Job store ready");

    // ── Sweeper ─────────────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let sweeper = JobSweeper::new(repo.clone(), sweeper_config).spawn(shutdown_rx);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutting down");

    let _ = shutdown_tx.send(true);
    sweeper.await.context("Sweeper task panicked")?;
    Ok(())
}
