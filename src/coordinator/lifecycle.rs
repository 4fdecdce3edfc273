//! Progress reporting, cancellation and shutdown.

use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::error::Result;
use crate::progress::ProgressReport;
use crate::types::Event;

use super::MassDownloadCoordinator;

impl MassDownloadCoordinator {
    /// Read-only snapshot of run progress
    pub async fn get_progress_report(&self) -> ProgressReport {
        self.progress.report().await
    }

    /// Every error recorded so far, oldest first
    pub async fn errors(&self) -> Vec<String> {
        self.progress.errors().await
    }

    /// Stop admitting new channel and item work for the runs in flight
    ///
    /// Transfers already running finish; channels not yet started are reported
    /// `skipped` and items not yet started stay `pending`. The next call that
    /// starts work gets a fresh token, so the coordinator stays usable.
    pub fn cancel(&self) {
        let run = self.current_run_token();
        if !run.is_cancelled() {
            tracing::info!("Cancelling run, no new work will be admitted");
            run.cancel();
        }
    }

    /// Whether the current run was cancelled, or the coordinator shut down
    ///
    /// Becomes false again once a new run starts after [`cancel`](Self::cancel).
    pub fn is_cancelled(&self) -> bool {
        self.root_cancel.is_cancelled() || self.current_run_token().is_cancelled()
    }

    /// Gracefully shut down the coordinator
    ///
    /// 1. Stops accepting new calls (they fail with `ShuttingDown`)
    /// 2. Cancels every run so waiting work is skipped
    /// 3. Waits for in-flight channel workers, up to `coordinator.shutdown_timeout`
    /// 4. Closes the database
    /// 5. Emits [`Event::Shutdown`]
    ///
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            tracing::debug!("Shutdown already performed");
            return Ok(());
        }
        tracing::info!("Initiating graceful shutdown");

        tracing::info!("Cancelling all runs");
        self.root_cancel.cancel();
        self.channel_gate.close();

        let timeout = self.config.coordinator.shutdown_timeout;
        match tokio::time::timeout(timeout, self.wait_for_active_channels()).await {
            Ok(()) => tracing::info!("All channel workers finished"),
            Err(_) => tracing::warn!(
                timeout_secs = timeout.as_secs(),
                still_running = self.channel_gate.in_flight(),
                "Timeout waiting for channel workers, proceeding with shutdown"
            ),
        }

        if let Some(db) = &self.db {
            db.close().await;
            tracing::info!("Database closed");
        }

        self.emit(Event::Shutdown);
        tracing::info!("Graceful shutdown complete");
        Ok(())
    }

    async fn wait_for_active_channels(&self) {
        loop {
            let active = self.channel_gate.in_flight();
            if active == 0 {
                return;
            }
            tracing::debug!(active, "Waiting for channel workers to finish");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}
