//! Bounded fan-out over many channels.

use futures::future::join_all;

use crate::error::Result;
use crate::types::{ChannelProcessingResult, Event, PersonRecord, ProcessingStatus};

use super::MassDownloadCoordinator;

impl MassDownloadCoordinator {
    /// Process many channels, at most `max_concurrent_channels` at a time
    ///
    /// Each channel waits for resource admission before it starts. Results come
    /// back in input order; one channel's failure never affects another.
    /// Channels still waiting when the run is cancelled are reported `skipped`.
    ///
    /// # Errors
    ///
    /// [`Error::ShuttingDown`](crate::Error::ShuttingDown) after shutdown, and
    /// [`Error::Cancelled`](crate::Error::Cancelled) once a token attached with
    /// [`with_cancellation`](Self::with_cancellation) has fired.
    pub async fn process_channels_concurrently(
        &self,
        channels: Vec<(PersonRecord, String)>,
    ) -> Result<Vec<ChannelProcessingResult>> {
        self.run_channels(channels, false).await
    }

    /// [`process_channels_concurrently`](Self::process_channels_concurrently) with
    /// the download phase enabled when `coordinator.download_videos` is set
    pub async fn process_channels_with_downloads(
        &self,
        channels: Vec<(PersonRecord, String)>,
    ) -> Result<Vec<ChannelProcessingResult>> {
        let download = self.config.coordinator.download_videos;
        self.run_channels(channels, download).await
    }

    async fn run_channels(
        &self,
        channels: Vec<(PersonRecord, String)>,
        download: bool,
    ) -> Result<Vec<ChannelProcessingResult>> {
        self.ensure_accepting()?;
        let cancel = self.begin_run_token()?;
        if channels.is_empty() {
            return Ok(Vec::new());
        }

        let total = channels.len();
        self.progress.begin_run(total).await;
        tracing::info!(
            channels = total,
            max_concurrent = self.config.limits.max_concurrent_channels,
            download,
            "Starting channel batch"
        );

        let mut owners = Vec::with_capacity(total);
        let mut handles = Vec::with_capacity(total);
        for (person, channel_url) in channels {
            owners.push((person.clone(), channel_url.clone()));
            let this = self.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                this.run_admitted(&person, &channel_url, download, &cancel)
                    .await
            }));
        }

        let mut results = Vec::with_capacity(total);
        for ((person, channel_url), joined) in owners.into_iter().zip(join_all(handles).await) {
            let result = match joined {
                Ok(result) => result,
                Err(e) => {
                    // The worker died before recording anything
                    let message = format!("channel worker failed: {e}");
                    tracing::error!(channel_url = %channel_url, error = %message, "Channel worker panicked");
                    let mut result = ChannelProcessingResult::new(&channel_url, person.owner_id());
                    result.finish(ProcessingStatus::Failed, Some(message.clone()));
                    self.emit(Event::ChannelFailed {
                        channel_url: channel_url.clone(),
                        error: message,
                    });
                    self.progress.record_channel(&result, download).await;
                    result
                }
            };
            results.push(result);
        }

        let completed = results
            .iter()
            .filter(|r| r.status == ProcessingStatus::Completed)
            .count();
        tracing::info!(
            channels = total,
            completed,
            failed = results
                .iter()
                .filter(|r| r.status == ProcessingStatus::Failed)
                .count(),
            "Channel batch finished"
        );
        Ok(results)
    }
}
