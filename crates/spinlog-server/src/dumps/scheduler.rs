//! Periodic auto-trigger for the current month's batch
//!
//! When enabled, checks on an interval whether the current calendar month
//! has a batch yet and triggers the download if not. Runs directly as a
//! background task; the admin API can always trigger manually regardless.

use tokio::time::{sleep, Duration};
use tracing::{debug, error, info};

use spinlog_common::YearMonth;

use super::batch_store::BatchStore;
use super::orchestrator::DumpOrchestrator;
use super::DumpError;

/// Initial delay so the server finishes starting before the first check
const STARTUP_DELAY: Duration = Duration::from_secs(30);

/// Background scheduler for monthly dump ingestion
pub struct DumpScheduler {
    orchestrator: DumpOrchestrator,
    batch_store: BatchStore,
    check_interval: Duration,
}

impl DumpScheduler {
    pub fn new(
        orchestrator: DumpOrchestrator,
        batch_store: BatchStore,
        check_interval: Duration,
    ) -> Self {
        Self {
            orchestrator,
            batch_store,
            check_interval,
        }
    }

    /// Start the scheduler in the background
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "Dump scheduler started (check interval: {}s)",
                self.check_interval.as_secs()
            );
            sleep(STARTUP_DELAY).await;

            loop {
                if let Err(e) = self.check_current_month().await {
                    error!("Dump scheduler check failed: {}", e);
                }
                sleep(self.check_interval).await;
            }
        })
    }

    /// Trigger the current month when no batch exists for it yet
    async fn check_current_month(&self) -> super::Result<()> {
        let year_month = YearMonth::current();

        if self.batch_store.batch_status(year_month).await?.is_some() {
            debug!("Batch for {} already exists, nothing to do", year_month);
            return Ok(());
        }

        match self.orchestrator.trigger_download(year_month).await {
            Ok(()) => {
                info!("Scheduler triggered dump download for {}", year_month);
                Ok(())
            },
            // Another batch is busy; the next check will catch up
            Err(DumpError::Conflict) => {
                debug!("Scheduler skipped {}: another batch is active", year_month);
                Ok(())
            },
            Err(e) => Err(e),
        }
    }
}
