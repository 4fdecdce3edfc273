//! Per-channel state machine.
//!
//! `pending -> discovering -> (downloading) -> completed | failed`, plus
//! `skipped` for channels that never get admitted.

use std::sync::Arc;

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::download::CANCELLED_BEFORE_START;
use crate::error::{Error, Result};
use crate::recovery::DeadLetterEntry;
use crate::resources::AdmissionGate;
use crate::types::{
    ChannelProcessingResult, DownloadResult, DownloadStatus, Event, PendingItemRecord,
    PersonRecord, ProcessingStatus, VideoMetadata,
};

use super::MassDownloadCoordinator;

impl MassDownloadCoordinator {
    /// Discover and enumerate one channel without downloading
    ///
    /// Non-duplicate items become [`PendingItemRecord`]s (and are stored when
    /// persistence is enabled). The channel ends `completed` or `failed`; it is
    /// `skipped` if the run was cancelled or admission timed out.
    ///
    /// # Errors
    ///
    /// [`Error::ShuttingDown`] after [`shutdown`](Self::shutdown), and
    /// [`Error::Cancelled`] once a token attached with
    /// [`with_cancellation`](Self::with_cancellation) has fired. Every
    /// channel-level problem is reported in the result.
    pub async fn process_channel(
        &self,
        person: &PersonRecord,
        channel_url: &str,
    ) -> Result<ChannelProcessingResult> {
        self.ensure_accepting()?;
        let cancel = self.begin_run_token()?;
        self.progress.begin_run(1).await;
        Ok(self.run_admitted(person, channel_url, false, &cancel).await)
    }

    /// [`process_channel`](Self::process_channel), then download the new items
    /// when `coordinator.download_videos` is enabled
    pub async fn process_channel_with_downloads(
        &self,
        person: &PersonRecord,
        channel_url: &str,
    ) -> Result<ChannelProcessingResult> {
        self.ensure_accepting()?;
        let cancel = self.begin_run_token()?;
        self.progress.begin_run(1).await;
        let download = self.config.coordinator.download_videos;
        Ok(self.run_admitted(person, channel_url, download, &cancel).await)
    }

    /// Wait for a channel slot, run the channel and fold the result into progress.
    pub(super) async fn run_admitted(
        &self,
        person: &PersonRecord,
        channel_url: &str,
        download: bool,
        cancel: &CancellationToken,
    ) -> ChannelProcessingResult {
        let deadline = self
            .config
            .coordinator
            .job_timeout
            .map(|t| Instant::now() + t);
        let result = match self.channel_gate.admit(cancel, deadline).await {
            Ok(permit) => {
                let result = self.run_channel(person, channel_url, download, cancel).await;
                drop(permit);
                result
            }
            Err(e) => self.skip_channel(person, channel_url, e).await,
        };
        self.progress.record_channel(&result, download).await;
        result
    }

    async fn run_channel(
        &self,
        person: &PersonRecord,
        channel_url: &str,
        download: bool,
        cancel: &CancellationToken,
    ) -> ChannelProcessingResult {
        let owner_id = person.owner_id();
        let mut result = ChannelProcessingResult::new(channel_url, &owner_id);
        result.started_at = Some(Utc::now());

        if cancel.is_cancelled() {
            return self
                .skip_channel(person, channel_url, Error::Cancelled)
                .await;
        }

        result.status = ProcessingStatus::Discovering;
        tracing::info!(channel_url, owner_id = %owner_id, "Processing channel");
        self.emit(Event::ChannelStarted {
            channel_url: channel_url.to_string(),
        });
        if let Some(db) = &self.db {
            if let Err(e) = db.upsert_owner(person).await {
                tracing::warn!(channel_url, error = %e, "Failed to store channel owner");
            }
        }

        match self.discovery.extract_channel_info(channel_url).await {
            Ok(info) => {
                tracing::debug!(channel_url, title = %info.title, "Channel resolved");
                result.channel_info = Some(info);
            }
            Err(e) => {
                return self.fail_channel(result, format!("Channel discovery failed: {e}"));
            }
        }

        let items = match self
            .discovery
            .enumerate_items(channel_url, self.config.coordinator.max_videos_per_channel)
            .await
        {
            Ok(items) => items,
            Err(e) => {
                return self.fail_channel(result, format!("Video enumeration failed: {e}"));
            }
        };
        result.items_found = items.len();
        if items.is_empty() {
            tracing::info!(channel_url, "Channel has no items");
            return self.complete_channel(result);
        }

        let (fresh, skipped) = self.discovery.filter_new(items).await;
        result.items_skipped = skipped;
        let claimed: Vec<String> = fresh.iter().map(|v| v.video_id.clone()).collect();

        let result = self
            .process_claimed(result, &owner_id, fresh, download, cancel)
            .await;
        // Completed items were promoted to processed; everything else is free again
        self.tracker.release_all(&claimed).await;
        result
    }

    /// Store, and optionally download, the items this channel claimed.
    async fn process_claimed(
        &self,
        mut result: ChannelProcessingResult,
        owner_id: &str,
        fresh: Vec<VideoMetadata>,
        download: bool,
        cancel: &CancellationToken,
    ) -> ChannelProcessingResult {
        let channel_url = result.channel_url.clone();
        let mut records = Vec::with_capacity(fresh.len());
        for video in &fresh {
            match PendingItemRecord::new(owner_id, video, None) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(channel_url = %channel_url, video_id = %video.video_id, error = %e, "Skipping unusable item");
                    result.items_skipped += 1;
                }
            }
        }
        result.items_processed = records.len();
        self.store_records(&mut records).await;
        tracing::info!(
            channel_url = %channel_url,
            found = result.items_found,
            new = result.items_processed,
            skipped = result.items_skipped,
            "Channel enumerated"
        );

        if download && !records.is_empty() {
            result.status = ProcessingStatus::Downloading;
            match self.download_records(&mut records, cancel).await {
                Ok(downloads) => {
                    self.record_downloads(&mut result, &records, &downloads)
                        .await;
                }
                Err(e) => {
                    let message = format!("Download phase failed: {e}");
                    if !self.config.coordinator.continue_on_error {
                        return self.fail_channel(result, message);
                    }
                    self.progress
                        .record_error(&format!("{channel_url}: {message}"))
                        .await;
                }
            }
        }

        self.complete_channel(result)
    }

    /// Inner pool: per-channel item transfers, gated on resource pressure
    pub(super) async fn download_records(
        &self,
        records: &mut [PendingItemRecord],
        cancel: &CancellationToken,
    ) -> Result<Vec<DownloadResult>> {
        let gate = Arc::new(
            AdmissionGate::new(
                "downloads",
                self.config.limits.max_concurrent_downloads,
                Some(Arc::clone(&self.monitor)),
                self.config.coordinator.admission_poll_interval,
            )
            .with_progress(Arc::clone(&self.progress)),
        );
        self.downloads
            .batch_download_gated(records, gate, cancel, self.config.coordinator.job_timeout)
            .await
    }

    /// Count outcomes, settle each one and queue failures for retry.
    async fn record_downloads(
        &self,
        result: &mut ChannelProcessingResult,
        records: &[PendingItemRecord],
        downloads: &[DownloadResult],
    ) {
        for (record, download) in records.iter().zip(downloads) {
            self.settle_download(download).await;
            match download.status() {
                DownloadStatus::Completed => result.items_downloaded += 1,
                DownloadStatus::Failed => {
                    result.items_failed += 1;
                    let entry = DeadLetterEntry::new(
                        record.clone(),
                        self.config.download.download_mode.as_str(),
                        download.error_message().unwrap_or("unknown error"),
                    );
                    self.queue_dead_letter(entry).await;
                }
                DownloadStatus::Pending | DownloadStatus::Downloading => {}
            }
        }
        tracing::info!(
            channel_url = %result.channel_url,
            downloaded = result.items_downloaded,
            failed = result.items_failed,
            "Channel downloads finished"
        );
    }

    /// Mark a completed item processed, emit its event and persist the outcome.
    pub(super) async fn settle_download(&self, download: &DownloadResult) {
        match download.status() {
            DownloadStatus::Completed => {
                if let Err(e) = self
                    .tracker
                    .mark_processed(download.video_id(), download.video_uuid())
                    .await
                {
                    tracing::warn!(video_id = download.video_id(), error = %e, "Failed to mark item processed");
                }
                if let Some(db) = &self.db {
                    if let Err(e) = db
                        .mark_processed(download.video_id(), download.video_uuid())
                        .await
                    {
                        self.progress
                            .record_error(&format!(
                                "Failed to persist processed item {}: {}",
                                download.video_id(),
                                e
                            ))
                            .await;
                    }
                }
                self.emit(Event::ItemCompleted {
                    video_id: download.video_id().to_string(),
                    remote_path: download.remote_path().map(str::to_string),
                });
            }
            DownloadStatus::Failed => {
                self.emit(Event::ItemFailed {
                    video_id: download.video_id().to_string(),
                    error: download.error_message().unwrap_or("unknown error").to_string(),
                });
            }
            DownloadStatus::Pending | DownloadStatus::Downloading => {}
        }

        if let Some(db) = &self.db {
            if let Err(e) = db.update_video_status(download).await {
                tracing::warn!(video_id = download.video_id(), error = %e, "Failed to store download outcome");
            }
        }
    }

    pub(super) async fn queue_dead_letter(&self, entry: DeadLetterEntry) {
        let video_id = entry.item.video_id.clone();
        if let Err(e) = self.dead_letters.push(entry).await {
            tracing::warn!(video_id = %video_id, error = %e, "Failed to persist dead-letter queue");
        }
    }

    /// Persist records, adopting the UUID of any row already stored for the item.
    async fn store_records(&self, records: &mut [PendingItemRecord]) {
        let Some(db) = &self.db else {
            return;
        };
        for record in records {
            match db.upsert_video_record(record).await {
                Ok(uuid) => record.uuid = uuid,
                Err(e) => {
                    self.progress
                        .record_error(&format!(
                            "Failed to store item record {}: {}",
                            record.video_id, e
                        ))
                        .await;
                }
            }
        }
    }

    fn complete_channel(&self, mut result: ChannelProcessingResult) -> ChannelProcessingResult {
        result.finish(ProcessingStatus::Completed, None);
        tracing::info!(
            channel_url = %result.channel_url,
            items_found = result.items_found,
            duration_secs = result.duration_seconds().unwrap_or(0.0),
            "Channel completed"
        );
        self.emit(Event::ChannelCompleted {
            channel_url: result.channel_url.clone(),
            items_found: result.items_found,
            items_downloaded: result.items_downloaded,
        });
        result
    }

    fn fail_channel(
        &self,
        mut result: ChannelProcessingResult,
        message: String,
    ) -> ChannelProcessingResult {
        tracing::error!(channel_url = %result.channel_url, error = %message, "Channel failed");
        self.emit(Event::ChannelFailed {
            channel_url: result.channel_url.clone(),
            error: message.clone(),
        });
        result.finish(ProcessingStatus::Failed, Some(message));
        result
    }

    /// Result for a channel that never started.
    pub(super) async fn skip_channel(
        &self,
        person: &PersonRecord,
        channel_url: &str,
        cause: Error,
    ) -> ChannelProcessingResult {
        let reason = match cause {
            Error::Cancelled | Error::ShuttingDown => CANCELLED_BEFORE_START.to_string(),
            other => {
                let reason = format!("admission failed: {other}");
                self.progress
                    .record_error(&format!("{channel_url}: {reason}"))
                    .await;
                reason
            }
        };
        tracing::info!(channel_url, reason = %reason, "Channel skipped");
        self.emit(Event::ChannelSkipped {
            channel_url: channel_url.to_string(),
            reason: reason.clone(),
        });

        let mut result = ChannelProcessingResult::new(channel_url, person.owner_id());
        result.finish(ProcessingStatus::Skipped, Some(reason));
        result
    }
}
