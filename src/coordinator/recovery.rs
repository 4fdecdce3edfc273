//! Dead-letter retries and the recovery report.

use crate::error::Result;
use crate::recovery::{DeadLetterEntry, RecoveryReport};
use crate::types::{DownloadStatus, PendingItemRecord};

use super::MassDownloadCoordinator;

impl MassDownloadCoordinator {
    /// Download every item in the dead-letter queue again
    ///
    /// Returns `(succeeded, failed)`. Succeeded items are marked processed
    /// exactly as in a channel run. Items that fail again go back into the
    /// queue with their retry count bumped. Items another run has processed
    /// in the meantime are dropped, and items another run is downloading right
    /// now stay queued untouched, as do items the run was cancelled before.
    ///
    /// # Errors
    ///
    /// [`Error::ShuttingDown`](crate::Error::ShuttingDown) after shutdown,
    /// [`Error::Cancelled`](crate::Error::Cancelled) once an attached token has
    /// fired, and I/O errors preparing the download directory. In the last
    /// case every entry is put back.
    pub async fn retry_failed_operations(&self) -> Result<(usize, usize)> {
        self.ensure_accepting()?;
        let cancel = self.begin_run_token()?;

        let entries = self.dead_letters.take_all().await;
        if entries.is_empty() {
            return Ok((0, 0));
        }
        tracing::info!(count = entries.len(), "Retrying failed operations");

        let mut retrying = Vec::with_capacity(entries.len());
        for entry in entries {
            let video_id = entry.item.video_id.clone();
            if self.tracker.is_duplicate(&video_id).await {
                tracing::debug!(video_id = %video_id, "Dropping dead letter, item already processed");
            } else if self.tracker.try_reserve(&video_id).await {
                retrying.push(entry);
            } else {
                self.queue_dead_letter(entry).await;
            }
        }
        let claimed: Vec<String> = retrying
            .iter()
            .map(|e| e.item.video_id.clone())
            .collect();

        let mut records: Vec<PendingItemRecord> = retrying
            .iter()
            .map(|entry| {
                let mut record = entry.item.clone();
                record.download_status = DownloadStatus::Pending;
                record.error_message = None;
                record
            })
            .collect();

        let downloads = match self.download_records(&mut records, &cancel).await {
            Ok(downloads) => downloads,
            Err(e) => {
                self.tracker.release_all(&claimed).await;
                for entry in retrying {
                    self.queue_dead_letter(entry).await;
                }
                return Err(e);
            }
        };

        let (mut succeeded, mut failed) = (0, 0);
        for (entry, download) in retrying.into_iter().zip(&downloads) {
            self.settle_download(download).await;
            match download.status() {
                DownloadStatus::Completed => succeeded += 1,
                DownloadStatus::Failed => {
                    failed += 1;
                    let error = download.error_message().unwrap_or("unknown error");
                    self.queue_dead_letter(entry.retried(error)).await;
                }
                DownloadStatus::Pending | DownloadStatus::Downloading => {
                    self.queue_dead_letter(entry).await;
                }
            }
        }
        self.tracker.release_all(&claimed).await;

        tracing::info!(succeeded, failed, "Retry of failed operations finished");
        Ok((succeeded, failed))
    }

    /// Items waiting in the dead-letter queue, oldest first
    pub async fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.dead_letters.entries().await
    }

    /// Circuit states, dead-letter contents and the error log in one snapshot
    pub async fn get_recovery_report(&self) -> RecoveryReport {
        let entries = self.dead_letters.entries().await;
        let errors = self.progress.errors().await;
        RecoveryReport::build(self.circuit_states().await, &entries, &errors)
    }
}
