//! Run-wide progress accounting
//!
//! Every counter lives behind one mutex and changes through exactly two
//! functions: [`ProgressTracker::begin_run`] for the channel total and
//! [`ProgressTracker::record_channel`] for everything a finished channel
//! contributes. Workers finishing concurrently therefore never interleave a
//! compound read-modify-write.

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::types::{ChannelProcessingResult, ProcessingStatus};

/// Number of most recent errors included in a report
const RECENT_ERRORS: usize = 5;

#[derive(Debug, Default)]
struct ProgressState {
    total_channels: usize,
    channels_processed: usize,
    channels_failed: usize,
    channels_skipped: usize,
    total_videos: usize,
    videos_processed: usize,
    videos_failed: usize,
    videos_skipped: usize,
    started: Option<Instant>,
    errors: Vec<String>,
    results: Vec<ChannelProcessingResult>,
}

impl ProgressState {
    fn finished(&self) -> usize {
        self.channels_processed + self.channels_failed + self.channels_skipped
    }

    fn push_error(&mut self, message: &str) {
        self.errors
            .push(format!("[{}] {}", Utc::now().to_rfc3339(), message));
    }
}

/// Read-only snapshot of run progress
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProgressReport {
    /// Channels submitted
    pub total_channels: usize,
    /// Channels that completed
    pub channels_processed: usize,
    /// Channels that failed
    pub channels_failed: usize,
    /// Channels never started
    pub channels_skipped: usize,
    /// Channels not yet finished
    pub channels_remaining: usize,
    /// Finished channels as a share of submitted channels
    pub progress_percent: f64,
    /// Seconds since the first run began
    pub elapsed_seconds: f64,
    /// Average time per completed channel times the remaining channels
    pub estimated_remaining_seconds: Option<f64>,
    /// Errors recorded so far
    pub errors_count: usize,
    /// Last few errors, oldest first
    pub recent_errors: Vec<String>,
    /// Items enumerated across all channels
    pub total_videos: usize,
    /// Items processed (downloaded when the download phase ran)
    pub videos_processed: usize,
    /// Item downloads that failed
    pub videos_failed: usize,
    /// Items skipped as duplicates
    pub videos_skipped: usize,
    /// Completed channels as a share of finished channel results
    pub success_rate_percent: f64,
    /// Every recorded channel result, in completion order
    pub channel_results: Vec<ChannelProcessingResult>,
}

/// Aggregate counters for channels and items, plus an error log
#[derive(Debug, Default)]
pub struct ProgressTracker {
    state: Mutex<ProgressState>,
}

impl ProgressTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `channels` to the total and start the clock on the first call
    pub async fn begin_run(&self, channels: usize) {
        let mut state = self.state.lock().await;
        state.total_channels += channels;
        if state.started.is_none() {
            state.started = Some(Instant::now());
        }
    }

    /// Fold a terminal channel result into the counters
    ///
    /// `download_phase_ran` selects what counts as a processed item: completed
    /// downloads when true, newly recorded items otherwise.
    pub async fn record_channel(&self, result: &ChannelProcessingResult, download_phase_ran: bool) {
        let mut state = self.state.lock().await;
        match result.status {
            ProcessingStatus::Completed => state.channels_processed += 1,
            ProcessingStatus::Failed => state.channels_failed += 1,
            ProcessingStatus::Skipped => state.channels_skipped += 1,
            other => {
                tracing::warn!(
                    channel_url = %result.channel_url,
                    status = ?other,
                    "Ignoring non-terminal channel result"
                );
                return;
            }
        }

        state.total_videos += result.items_found;
        state.videos_skipped += result.items_skipped;
        state.videos_failed += result.items_failed;
        state.videos_processed += if download_phase_ran {
            result.items_downloaded
        } else {
            result.items_processed
        };

        if result.status == ProcessingStatus::Failed {
            let message = format!(
                "{}: {}",
                result.channel_url,
                result.error_message.as_deref().unwrap_or("unknown error")
            );
            state.push_error(&message);
        }
        state.results.push(result.clone());
    }

    /// Append a timestamped entry to the error log
    pub async fn record_error(&self, message: &str) {
        tracing::error!(error = message, "Processing error");
        self.state.lock().await.push_error(message);
    }

    /// Full error log, oldest first
    pub async fn errors(&self) -> Vec<String> {
        self.state.lock().await.errors.clone()
    }

    /// Snapshot of the current state
    pub async fn report(&self) -> ProgressReport {
        let state = self.state.lock().await;
        let finished = state.finished();
        let remaining = state.total_channels.saturating_sub(finished);
        let elapsed_seconds = state
            .started
            .map(|s| s.elapsed().as_secs_f64())
            .unwrap_or(0.0);

        let progress_percent = if state.total_channels == 0 {
            0.0
        } else {
            finished as f64 / state.total_channels as f64 * 100.0
        };
        let estimated_remaining_seconds = if state.channels_processed == 0 || remaining == 0 {
            None
        } else {
            Some(elapsed_seconds / state.channels_processed as f64 * remaining as f64)
        };
        let success_rate_percent = if state.results.is_empty() {
            0.0
        } else {
            state.channels_processed as f64 / state.results.len() as f64 * 100.0
        };
        let recent_errors = state
            .errors
            .iter()
            .skip(state.errors.len().saturating_sub(RECENT_ERRORS))
            .cloned()
            .collect();

        ProgressReport {
            total_channels: state.total_channels,
            channels_processed: state.channels_processed,
            channels_failed: state.channels_failed,
            channels_skipped: state.channels_skipped,
            channels_remaining: remaining,
            progress_percent,
            elapsed_seconds,
            estimated_remaining_seconds,
            errors_count: state.errors.len(),
            recent_errors,
            total_videos: state.total_videos,
            videos_processed: state.videos_processed,
            videos_failed: state.videos_failed,
            videos_skipped: state.videos_skipped,
            success_rate_percent,
            channel_results: state.results.clone(),
        }
    }
}
