//! Job sweeper: periodic lease reclaim and history retention.
//!
//! On startup, claims left behind by crashed workers are handed back to the
//! queue. Each tick then repeats the reclaim and applies the retention policy.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SweeperConfig;
use crate::jobs::HistoryCleanup;
use crate::store::BackgroundJobRepository;

/// What one sweep changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub reclaimed: u64,
    pub history: HistoryCleanup,
}

pub struct JobSweeper {
    repo: Arc<BackgroundJobRepository>,
    config: SweeperConfig,
}

impl JobSweeper {
    pub fn new(repo: Arc<BackgroundJobRepository>, config: SweeperConfig) -> Self {
        Self { repo, config }
    }

    /// Single sweep: reclaim stale claims, then apply retention.
    ///
    /// Failures are logged; the next tick tries again.
    pub async fn run_once(&self) -> SweepReport {
        let mut report = SweepReport::default();

        match self
            .repo
            .reset_stale_acknowledged_jobs(self.config.stale_threshold)
            .await
        {
            Ok(count) => report.reclaimed = count,
            Err(e) => warn!(error = %e, "Failed to reset stale jobs"),
        }

        match self
            .repo
            .clear_background_job_history(self.config.days_to_keep)
            .await
        {
            Ok(cleanup) => report.history = cleanup,
            Err(e) => warn!(error = %e, "Failed to clear job history"),
        }

        debug!(?report, "Sweep finished");
        report
    }

    /// Sweep until `shutdown` flips to `true` (or its sender is dropped).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            stale_secs = self.config.stale_threshold.as_secs(),
            "Job sweeper started"
        );

        let mut tick = tokio::time::interval(self.config.interval);
        // First tick fires immediately: that is the startup reclaim.
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.run_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Job sweeper stopped");
    }

    /// Run the sweeper on its own task.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}
