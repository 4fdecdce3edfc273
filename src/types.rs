//! Core types for mass-dl

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::config::DownloadMode;
use crate::error::{Error, Result};

/// Owner of a channel, as produced by the input layer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonRecord {
    /// Display name
    pub name: String,
    /// Contact email (may be empty)
    #[serde(default)]
    pub email: String,
    /// Free-form type tag (e.g. "creator", "client")
    #[serde(default, rename = "type")]
    pub kind: String,
    /// Channel URL this person owns
    pub channel_url: String,
}

impl PersonRecord {
    /// Create a new person record
    pub fn new(
        name: impl Into<String>,
        email: impl Into<String>,
        kind: impl Into<String>,
        channel_url: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            kind: kind.into(),
            channel_url: channel_url.into(),
        }
    }

    /// Stable identifier for the owner: the email when present, otherwise the name
    pub fn owner_id(&self) -> String {
        let email = self.email.trim();
        if email.is_empty() {
            self.name.trim().to_string()
        } else {
            email.to_lowercase()
        }
    }
}

/// Channel metadata resolved by discovery
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    /// Channel identifier
    pub channel_id: String,
    /// Channel title
    pub title: String,
    /// Subscriber count, if the source exposes it
    pub subscriber_count: Option<u64>,
    /// Number of items the source reports for the channel
    pub video_count: Option<u64>,
}

/// Metadata for one enumerated item (video)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoMetadata {
    /// Item identifier
    pub video_id: String,
    /// Title
    pub title: String,
    /// Duration in seconds
    pub duration_secs: Option<u64>,
    /// Publish date
    pub upload_date: Option<NaiveDate>,
    /// View count
    pub view_count: Option<u64>,
    /// Description
    pub description: Option<String>,
    /// Parent channel identifier
    pub channel_id: String,
    /// Uploader display name
    pub uploader: Option<String>,
    /// Canonical URL of the item
    pub url: String,
}

/// Download status of a single item
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    /// Not started
    #[default]
    Pending,
    /// Transfer in progress
    Downloading,
    /// Transfer finished and verified
    Completed,
    /// Transfer failed
    Failed,
}

impl DownloadStatus {
    /// Lowercase name, as stored in the database
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DownloadStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(DownloadStatus::Pending),
            "downloading" => Ok(DownloadStatus::Downloading),
            "completed" => Ok(DownloadStatus::Completed),
            "failed" => Ok(DownloadStatus::Failed),
            other => Err(Error::validation(format!(
                "status must be one of pending, downloading, completed, failed; got '{other}'"
            ))),
        }
    }
}

/// Unit of work handed to the download integration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingItemRecord {
    /// Owner identifier ([`PersonRecord::owner_id`])
    pub owner_id: String,
    /// Item identifier
    pub video_id: String,
    /// Title
    pub title: String,
    /// Duration in seconds
    pub duration_secs: Option<u64>,
    /// Publish date
    pub upload_date: Option<NaiveDate>,
    /// View count
    pub view_count: Option<u64>,
    /// URL the transfer client fetches
    pub url: String,
    /// Item UUID (validated at construction)
    pub uuid: String,
    /// Current download status, mirrored from the latest [`DownloadResult`]
    pub download_status: DownloadStatus,
    /// Remote path once uploaded
    pub remote_path: Option<String>,
    /// Size in bytes once transferred
    pub file_size: Option<u64>,
    /// Last error, if the download failed
    pub error_message: Option<String>,
}

impl PendingItemRecord {
    /// Build a record from enumerated metadata
    ///
    /// A supplied `uuid` must be a well-formed UUID string and is stored verbatim;
    /// when `None`, a fresh v4 UUID is generated.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for a malformed UUID or an empty item identifier.
    pub fn new(owner_id: &str, video: &VideoMetadata, uuid: Option<&str>) -> Result<Self> {
        if video.video_id.trim().is_empty() {
            return Err(Error::validation("video_id must be a non-empty string"));
        }
        let uuid = match uuid {
            Some(raw) => {
                uuid::Uuid::parse_str(raw).map_err(|e| {
                    Error::validation(format!("invalid UUID '{raw}': {e}"))
                })?;
                raw.to_string()
            }
            None => uuid::Uuid::new_v4().to_string(),
        };

        Ok(Self {
            owner_id: owner_id.to_string(),
            video_id: video.video_id.clone(),
            title: video.title.clone(),
            duration_secs: video.duration_secs,
            upload_date: video.upload_date,
            view_count: video.view_count,
            url: video.url.clone(),
            uuid,
            download_status: DownloadStatus::Pending,
            remote_path: None,
            file_size: None,
            error_message: None,
        })
    }

    /// Copy the outcome of a download attempt onto this record
    pub fn apply_result(&mut self, result: &DownloadResult) {
        self.download_status = result.status;
        self.remote_path = result.remote_path.clone();
        self.file_size = result.file_size;
        self.error_message = result.error_message.clone();
    }
}

/// Outcome of one download attempt
///
/// Immutable once built. Deserialization runs the same validation as
/// [`DownloadResult::new`], so a stored result with an empty id or an unknown
/// status is rejected.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawDownloadResult")]
pub struct DownloadResult {
    video_id: String,
    video_uuid: String,
    status: DownloadStatus,
    remote_path: Option<String>,
    local_path: Option<PathBuf>,
    file_size: Option<u64>,
    duration_seconds: f64,
    error_message: Option<String>,
    download_mode: Option<DownloadMode>,
}

#[derive(Deserialize)]
struct RawDownloadResult {
    video_id: String,
    video_uuid: String,
    status: String,
    #[serde(default)]
    remote_path: Option<String>,
    #[serde(default)]
    local_path: Option<PathBuf>,
    #[serde(default)]
    file_size: Option<u64>,
    #[serde(default)]
    duration_seconds: f64,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    download_mode: Option<DownloadMode>,
}

impl TryFrom<RawDownloadResult> for DownloadResult {
    type Error = Error;

    fn try_from(raw: RawDownloadResult) -> Result<Self> {
        let status: DownloadStatus = raw.status.parse()?;
        let mut result = DownloadResult::new(raw.video_id, raw.video_uuid, status)?;
        result.remote_path = raw.remote_path;
        result.local_path = raw.local_path;
        result.file_size = raw.file_size;
        result.duration_seconds = raw.duration_seconds;
        result.error_message = raw.error_message;
        result.download_mode = raw.download_mode;
        Ok(result)
    }
}

impl DownloadResult {
    /// Create a result for `video_id`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when `video_id` is empty.
    pub fn new(
        video_id: impl Into<String>,
        video_uuid: impl Into<String>,
        status: DownloadStatus,
    ) -> Result<Self> {
        let video_id = video_id.into();
        if video_id.trim().is_empty() {
            return Err(Error::validation("video_id must be a non-empty string"));
        }
        Ok(Self {
            video_id,
            video_uuid: video_uuid.into(),
            status,
            remote_path: None,
            local_path: None,
            file_size: None,
            duration_seconds: 0.0,
            error_message: None,
            download_mode: None,
        })
    }

    /// Completed result for a record
    pub(crate) fn completed(item: &PendingItemRecord) -> Self {
        Self::for_item(item, DownloadStatus::Completed)
    }

    /// Failed result for a record carrying `message`
    pub(crate) fn failed(item: &PendingItemRecord, message: impl Into<String>) -> Self {
        let mut result = Self::for_item(item, DownloadStatus::Failed);
        result.error_message = Some(message.into());
        result
    }

    /// Result for an item that was never started
    pub(crate) fn not_started(item: &PendingItemRecord, message: impl Into<String>) -> Self {
        let mut result = Self::for_item(item, DownloadStatus::Pending);
        result.error_message = Some(message.into());
        result
    }

    // Records are validated on construction, so the id is known to be non-empty.
    fn for_item(item: &PendingItemRecord, status: DownloadStatus) -> Self {
        Self {
            video_id: item.video_id.clone(),
            video_uuid: item.uuid.clone(),
            status,
            remote_path: None,
            local_path: None,
            file_size: None,
            duration_seconds: 0.0,
            error_message: None,
            download_mode: None,
        }
    }

    pub(crate) fn with_remote_path(mut self, path: Option<String>) -> Self {
        self.remote_path = path;
        self
    }

    pub(crate) fn with_local_path(mut self, path: Option<PathBuf>) -> Self {
        self.local_path = path;
        self
    }

    pub(crate) fn with_file_size(mut self, size: Option<u64>) -> Self {
        self.file_size = size;
        self
    }

    pub(crate) fn with_timing(mut self, mode: DownloadMode, duration_seconds: f64) -> Self {
        self.download_mode = Some(mode);
        self.duration_seconds = duration_seconds;
        self
    }

    /// Item identifier
    pub fn video_id(&self) -> &str {
        &self.video_id
    }

    /// Item UUID
    pub fn video_uuid(&self) -> &str {
        &self.video_uuid
    }

    /// Final status
    pub fn status(&self) -> DownloadStatus {
        self.status
    }

    /// Remote path, on success in a remote mode
    pub fn remote_path(&self) -> Option<&str> {
        self.remote_path.as_deref()
    }

    /// Local path, when the file was kept on disk
    pub fn local_path(&self) -> Option<&std::path::Path> {
        self.local_path.as_deref()
    }

    /// Size in bytes
    pub fn file_size(&self) -> Option<u64> {
        self.file_size
    }

    /// Wall-clock seconds spent on the attempt
    pub fn duration_seconds(&self) -> f64 {
        self.duration_seconds
    }

    /// Error message, if the attempt failed or never started
    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Mode the attempt ran in
    pub fn download_mode(&self) -> Option<DownloadMode> {
        self.download_mode
    }

    /// Whether the attempt completed
    pub fn is_completed(&self) -> bool {
        self.status == DownloadStatus::Completed
    }
}

/// Aggregate over a batch of download results
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DownloadStats {
    /// Number of results
    pub total: usize,
    /// Completed results
    pub completed: usize,
    /// Failed results
    pub failed: usize,
    /// completed / total * 100, or 0 for an empty batch
    pub success_rate: f64,
}

/// Per-channel processing state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    /// Not started
    #[default]
    Pending,
    /// Resolving channel info and enumerating items
    Discovering,
    /// Download phase running
    Downloading,
    /// Finished successfully
    Completed,
    /// Discovery or enumeration failed (or the download phase, without continue_on_error)
    Failed,
    /// Never started (cancelled or admission timed out)
    Skipped,
}

impl ProcessingStatus {
    /// Whether the channel has reached a final state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessingStatus::Completed | ProcessingStatus::Failed | ProcessingStatus::Skipped
        )
    }
}

/// Result of processing one channel
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelProcessingResult {
    /// Channel URL as supplied by the caller
    pub channel_url: String,
    /// Owner identifier
    pub owner_id: String,
    /// Current state
    pub status: ProcessingStatus,
    /// Channel metadata, once discovered
    pub channel_info: Option<ChannelInfo>,
    /// Items enumerated
    pub items_found: usize,
    /// Non-duplicate items turned into records
    pub items_processed: usize,
    /// Items skipped as duplicates
    pub items_skipped: usize,
    /// Items whose download completed
    pub items_downloaded: usize,
    /// Items whose download failed
    pub items_failed: usize,
    /// Error message for failed or skipped channels
    pub error_message: Option<String>,
    /// When processing started
    pub started_at: Option<DateTime<Utc>>,
    /// When processing reached a terminal state
    pub ended_at: Option<DateTime<Utc>>,
}

impl ChannelProcessingResult {
    /// Fresh result in the pending state
    pub fn new(channel_url: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            channel_url: channel_url.into(),
            owner_id: owner_id.into(),
            status: ProcessingStatus::Pending,
            channel_info: None,
            items_found: 0,
            items_processed: 0,
            items_skipped: 0,
            items_downloaded: 0,
            items_failed: 0,
            error_message: None,
            started_at: None,
            ended_at: None,
        }
    }

    /// Seconds between start and end; None until both are set
    pub fn duration_seconds(&self) -> Option<f64> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }

    /// Share of found items that were processed, in percent
    pub fn success_rate(&self) -> f64 {
        if self.items_found == 0 {
            return 0.0;
        }
        self.items_processed as f64 / self.items_found as f64 * 100.0
    }

    pub(crate) fn finish(&mut self, status: ProcessingStatus, error: Option<String>) {
        self.status = status;
        if error.is_some() {
            self.error_message = error;
        }
        self.ended_at = Some(Utc::now());
    }
}

/// Events emitted by the coordinator
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A channel worker started discovery
    ChannelStarted {
        /// Channel URL
        channel_url: String,
    },
    /// A channel reached `completed`
    ChannelCompleted {
        /// Channel URL
        channel_url: String,
        /// Items enumerated
        items_found: usize,
        /// Items downloaded in this run
        items_downloaded: usize,
    },
    /// A channel reached `failed`
    ChannelFailed {
        /// Channel URL
        channel_url: String,
        /// Failure reason
        error: String,
    },
    /// A channel was never started
    ChannelSkipped {
        /// Channel URL
        channel_url: String,
        /// Reason
        reason: String,
    },
    /// An item download completed
    ItemCompleted {
        /// Item identifier
        video_id: String,
        /// Remote path, for remote modes
        remote_path: Option<String>,
    },
    /// An item download failed
    ItemFailed {
        /// Item identifier
        video_id: String,
        /// Failure reason
        error: String,
    },
    /// Coordinator shut down
    Shutdown,
}
