//! Download integration
//!
//! Drives one item through the configured [`DownloadMode`]:
//!
//! - `stream_to_remote`: the storage client fetches and stores the item; nothing
//!   touches local disk.
//! - `local_then_upload`: fetch to disk, confirm the file exists, upload it, then
//!   delete it if `delete_after_upload` is set. A failed upload keeps the file.
//! - `local_only`: fetch to disk and confirm the file exists.
//!
//! A client's success flag is never trusted on its own: a local transfer that
//! claims success for a path that does not exist is a failure.
//!
//! Every error ends up in the item's [`DownloadResult`]; nothing item-level
//! escapes [`DownloadIntegration::batch_download`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::clients::{LocalDownloader, RemoteStorage, TransferRequest};
use crate::config::{DownloadConfig, DownloadMode};
use crate::error::{Error, Result};
use crate::resources::AdmissionGate;
use crate::retry::RetryExecutor;
use crate::types::{DownloadResult, DownloadStats, DownloadStatus, PendingItemRecord};

/// Message carried by items that were never started because of cancellation
pub const CANCELLED_BEFORE_START: &str = "cancelled before start";

/// Retry and circuit-breaker key for local transfers
const OP_LOCAL: &str = "video-download";
/// Retry and circuit-breaker key for direct remote streaming
const OP_STREAM: &str = "remote-stream";
/// Retry and circuit-breaker key for uploads of local files
const OP_UPLOAD: &str = "remote-upload";

/// Outcome of the local-fetch step
enum LocalOutcome {
    /// File confirmed on disk
    Ready { path: PathBuf, size: u64 },
    /// Client failure or missing artifact
    Failed { message: String, path: Option<PathBuf> },
}

/// Runs item transfers through the external clients
#[derive(Clone)]
pub struct DownloadIntegration {
    config: Arc<DownloadConfig>,
    retry: RetryExecutor,
    local: Arc<dyn LocalDownloader>,
    remote: Option<Arc<dyn RemoteStorage>>,
}

impl DownloadIntegration {
    /// Create an integration for `config`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the mode needs remote storage and either
    /// the bucket or the storage client is missing.
    pub fn new(
        config: DownloadConfig,
        retry: RetryExecutor,
        local: Arc<dyn LocalDownloader>,
        remote: Option<Arc<dyn RemoteStorage>>,
    ) -> Result<Self> {
        config.validate()?;
        if config.download_mode.requires_remote() && remote.is_none() {
            return Err(Error::config(
                "remote_storage",
                format!(
                    "a remote storage client is required for mode {}",
                    config.download_mode
                ),
            ));
        }
        tracing::info!(
            mode = %config.download_mode,
            local_dir = %config.local_download_dir.display(),
            "Download integration initialized"
        );
        Ok(Self {
            config: Arc::new(config),
            retry,
            local,
            remote,
        })
    }

    /// Active configuration
    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    /// Object key an item is stored under: `<prefix>/<video_id>_<uuid>.<format>`
    pub fn remote_key(&self, item: &PendingItemRecord) -> String {
        let name = format!("{}_{}.{}", item.video_id, item.uuid, self.config.format);
        let prefix = self.config.remote_prefix.trim_matches('/');
        if prefix.is_empty() {
            name
        } else {
            format!("{prefix}/{name}")
        }
    }

    /// Directory local transfers for `owner_id` write into
    pub fn owner_dir(&self, owner_id: &str) -> PathBuf {
        self.config
            .local_download_dir
            .join(sanitize_path_component(owner_id))
    }

    /// Download a single item
    ///
    /// Never fails: client errors, retry exhaustion and I/O problems are
    /// reported as a result with status `failed`.
    pub async fn download_one(&self, item: &PendingItemRecord) -> DownloadResult {
        let started = Instant::now();
        let mode = self.config.download_mode;
        tracing::debug!(video_id = %item.video_id, mode = %mode, "Starting item download");

        let outcome = match mode {
            DownloadMode::StreamToRemote => self.stream_to_remote(item).await,
            DownloadMode::LocalThenUpload => self.local_then_upload(item).await,
            DownloadMode::LocalOnly => self.local_only(item).await,
        };
        let result = outcome.unwrap_or_else(|e| DownloadResult::failed(item, e.to_string()));
        let result = result.with_timing(mode, started.elapsed().as_secs_f64());

        match result.error_message() {
            None => tracing::info!(
                video_id = %item.video_id,
                remote_path = result.remote_path().unwrap_or(""),
                duration_secs = result.duration_seconds(),
                "Item download completed"
            ),
            Some(error) => tracing::error!(
                video_id = %item.video_id,
                error,
                "Item download failed"
            ),
        }
        result
    }

    /// Download `items` with at most `max_concurrent` transfers in flight
    ///
    /// Results come back in input order, and each item's status fields are
    /// updated in place to mirror its result. Items are updated once the whole
    /// batch has finished, so they go straight from `pending` to their final
    /// status and are never observed as `downloading`.
    ///
    /// # Errors
    ///
    /// Fails as a whole only when the local download directory cannot be
    /// prepared; individual item failures are reported in the results.
    pub async fn batch_download(
        &self,
        items: &mut [PendingItemRecord],
        max_concurrent: usize,
    ) -> Result<Vec<DownloadResult>> {
        let gate = Arc::new(AdmissionGate::unmonitored("downloads", max_concurrent));
        self.batch_download_gated(items, gate, &CancellationToken::new(), None)
            .await
    }

    /// [`batch_download`](Self::batch_download) with caller-supplied admission
    ///
    /// Each item waits on `gate` before starting. Items still waiting when
    /// `cancel` fires are returned as `pending` with [`CANCELLED_BEFORE_START`];
    /// items whose wait exceeds `admission_timeout` fail with "admission timed out".
    /// Transfers already running are allowed to finish.
    pub async fn batch_download_gated(
        &self,
        items: &mut [PendingItemRecord],
        gate: Arc<AdmissionGate>,
        cancel: &CancellationToken,
        admission_timeout: Option<Duration>,
    ) -> Result<Vec<DownloadResult>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        if self.config.download_mode != DownloadMode::StreamToRemote {
            let mut owners: Vec<&str> = items.iter().map(|i| i.owner_id.as_str()).collect();
            owners.sort_unstable();
            owners.dedup();
            for owner in owners {
                tokio::fs::create_dir_all(self.owner_dir(owner)).await?;
            }
        }

        let handles: Vec<_> = items
            .iter()
            .cloned()
            .map(|item| {
                let this = self.clone();
                let gate = Arc::clone(&gate);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if cancel.is_cancelled() {
                        return DownloadResult::not_started(&item, CANCELLED_BEFORE_START);
                    }
                    let deadline = admission_timeout.map(|t| Instant::now() + t);
                    let _permit = match gate.admit(&cancel, deadline).await {
                        Ok(permit) => permit,
                        Err(Error::Cancelled | Error::ShuttingDown) => {
                            return DownloadResult::not_started(&item, CANCELLED_BEFORE_START);
                        }
                        Err(e @ Error::AdmissionTimeout { .. }) => {
                            tracing::warn!(video_id = %item.video_id, error = %e, "Item admission timed out");
                            return DownloadResult::failed(&item, "admission timed out");
                        }
                        Err(e) => return DownloadResult::failed(&item, e.to_string()),
                    };
                    this.download_one(&item).await
                })
            })
            .collect();

        let joined = join_all(handles).await;
        let mut results = Vec::with_capacity(items.len());
        for (item, outcome) in items.iter_mut().zip(joined) {
            let result = match outcome {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(video_id = %item.video_id, error = %e, "Download task panicked");
                    DownloadResult::failed(item, format!("download task failed: {e}"))
                }
            };
            item.apply_result(&result);
            results.push(result);
        }
        Ok(results)
    }

    /// Aggregate counts over `results`
    pub fn stats(results: &[DownloadResult]) -> DownloadStats {
        let total = results.len();
        let completed = results.iter().filter(|r| r.is_completed()).count();
        let failed = results
            .iter()
            .filter(|r| r.status() == DownloadStatus::Failed)
            .count();
        let success_rate = if total == 0 {
            0.0
        } else {
            completed as f64 / total as f64 * 100.0
        };
        DownloadStats {
            total,
            completed,
            failed,
            success_rate,
        }
    }

    fn request_for(&self, item: &PendingItemRecord) -> TransferRequest {
        TransferRequest {
            video_id: item.video_id.clone(),
            url: item.url.clone(),
            output_dir: self.owner_dir(&item.owner_id),
            resolution: self.config.resolution.clone(),
            format: self.config.format.clone(),
            include_subtitles: self.config.include_subtitles,
        }
    }

    fn remote_target(&self) -> Result<(&Arc<dyn RemoteStorage>, &str)> {
        let remote = self.remote.as_ref().ok_or_else(|| {
            Error::config("remote_storage", "no remote storage client configured")
        })?;
        let bucket = self
            .config
            .remote_bucket
            .as_deref()
            .ok_or_else(|| Error::config("remote_bucket", "remote bucket is not configured"))?;
        Ok((remote, bucket))
    }

    async fn stream_to_remote(&self, item: &PendingItemRecord) -> Result<DownloadResult> {
        let (remote, bucket) = self.remote_target()?;
        let request = self.request_for(item);
        let key = self.remote_key(item);

        let transfer = self
            .retry
            .execute(OP_STREAM, || remote.stream_to_remote(&request, bucket, &key))
            .await?;

        if !transfer.success {
            let message = transfer
                .error
                .unwrap_or_else(|| "remote stream reported failure".to_string());
            return Ok(DownloadResult::failed(item, message));
        }
        let remote_path = transfer
            .remote_path
            .unwrap_or_else(|| format!("{bucket}/{key}"));
        Ok(DownloadResult::completed(item)
            .with_remote_path(Some(remote_path))
            .with_file_size(transfer.size_bytes))
    }

    async fn local_then_upload(&self, item: &PendingItemRecord) -> Result<DownloadResult> {
        let (remote, bucket) = self.remote_target()?;
        let (path, size) = match self.fetch_local(item).await? {
            LocalOutcome::Ready { path, size } => (path, size),
            LocalOutcome::Failed { message, path } => {
                return Ok(DownloadResult::failed(item, message).with_local_path(path));
            }
        };

        let key = self.remote_key(item);
        let upload = self
            .retry
            .execute(OP_UPLOAD, || remote.upload_file(&path, bucket, &key))
            .await;
        let transfer = match upload {
            Ok(transfer) if transfer.success => transfer,
            Ok(transfer) => {
                let message = transfer
                    .error
                    .unwrap_or_else(|| "upload reported failure".to_string());
                tracing::warn!(video_id = %item.video_id, path = %path.display(), "Upload failed, keeping local file");
                return Ok(DownloadResult::failed(item, message).with_local_path(Some(path)));
            }
            Err(e) => {
                tracing::warn!(video_id = %item.video_id, path = %path.display(), "Upload failed, keeping local file");
                return Ok(DownloadResult::failed(item, e.to_string()).with_local_path(Some(path)));
            }
        };

        let local_path = if self.config.delete_after_upload {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    tracing::debug!(path = %path.display(), "Deleted local file after upload");
                    None
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to delete local file after upload");
                    Some(path)
                }
            }
        } else {
            Some(path)
        };

        let remote_path = transfer
            .remote_path
            .unwrap_or_else(|| format!("{bucket}/{key}"));
        Ok(DownloadResult::completed(item)
            .with_remote_path(Some(remote_path))
            .with_local_path(local_path)
            .with_file_size(transfer.size_bytes.or(Some(size))))
    }

    async fn local_only(&self, item: &PendingItemRecord) -> Result<DownloadResult> {
        Ok(match self.fetch_local(item).await? {
            LocalOutcome::Ready { path, size } => DownloadResult::completed(item)
                .with_local_path(Some(path))
                .with_file_size(Some(size)),
            LocalOutcome::Failed { message, path } => {
                DownloadResult::failed(item, message).with_local_path(path)
            }
        })
    }

    /// Run the local client and confirm the file it claims to have written
    async fn fetch_local(&self, item: &PendingItemRecord) -> Result<LocalOutcome> {
        let request = self.request_for(item);
        tokio::fs::create_dir_all(&request.output_dir).await?;

        let transfer = self
            .retry
            .execute(OP_LOCAL, || self.local.download_to_disk(&request))
            .await?;

        if !transfer.success {
            return Ok(LocalOutcome::Failed {
                message: transfer
                    .error
                    .unwrap_or_else(|| "local download reported failure".to_string()),
                path: None,
            });
        }

        let Some(path) = transfer.path else {
            return Ok(LocalOutcome::Failed {
                message: "file not found: client reported success without a path".to_string(),
                path: None,
            });
        };
        match file_size(&path).await {
            Some(size) => Ok(LocalOutcome::Ready { path, size }),
            None => {
                tracing::warn!(video_id = %item.video_id, path = %path.display(), "Client reported success but file is missing");
                Ok(LocalOutcome::Failed {
                    message: format!("file not found at {}", path.display()),
                    path: None,
                })
            }
        }
    }
}

/// Size of the regular file at `path`, or None when there is no such file
async fn file_size(path: &Path) -> Option<u64> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Some(meta.len()),
        _ => None,
    }
}

/// Make an owner id safe to use as a single directory name
pub fn sanitize_path_component(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | '@') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "unknown".to_string()
    } else {
        cleaned
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
