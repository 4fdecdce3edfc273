//! Capability traits for the external clients the engine drives
//!
//! The engine never talks to a video platform, a downloader binary or an
//! object store directly. Callers hand it implementations of these traits;
//! tests hand it fakes.
//!
//! Errors returned from these methods are classified by
//! [`IsRetryable`](crate::retry::IsRetryable): return [`Error::Timeout`],
//! [`Error::RateLimited`] or [`Error::Network`] for transient failures and
//! [`Error::NotFound`] or [`Error::Unavailable`] for permanent ones.
//!
//! [`Error::Timeout`]: crate::Error::Timeout
//! [`Error::RateLimited`]: crate::Error::RateLimited
//! [`Error::Network`]: crate::Error::Network
//! [`Error::NotFound`]: crate::Error::NotFound
//! [`Error::Unavailable`]: crate::Error::Unavailable

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::types::{ChannelInfo, VideoMetadata};

/// Parameters for one item transfer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferRequest {
    /// Item identifier
    pub video_id: String,
    /// URL to fetch
    pub url: String,
    /// Directory local transfers write into
    pub output_dir: PathBuf,
    /// Requested resolution (e.g. "720")
    pub resolution: String,
    /// Container format (e.g. "mp4")
    pub format: String,
    /// Fetch subtitles alongside the media
    pub include_subtitles: bool,
}

/// Outcome of a local transfer
#[must_use]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LocalTransfer {
    /// Whether the client reports success
    pub success: bool,
    /// Path of the written file
    pub path: Option<PathBuf>,
    /// Client error message on failure
    pub error: Option<String>,
}

/// Outcome of a remote transfer
#[must_use]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RemoteTransfer {
    /// Whether the client reports success
    pub success: bool,
    /// Full remote path of the stored object
    pub remote_path: Option<String>,
    /// Bytes stored
    pub size_bytes: Option<u64>,
    /// Client error message on failure
    pub error: Option<String>,
}

/// Resolves channels and lists their items
#[async_trait]
pub trait ChannelEnumerator: Send + Sync {
    /// Resolve metadata for the channel at `channel_url`
    ///
    /// Returns `Ok(None)` when the source has no channel at that URL.
    async fn extract_channel_info(&self, channel_url: &str) -> Result<Option<ChannelInfo>>;

    /// List the channel's items, newest first, stopping after `max_items`
    async fn enumerate_items(
        &self,
        channel_url: &str,
        max_items: Option<usize>,
    ) -> Result<Vec<VideoMetadata>>;
}

/// Fetches an item onto local disk
#[async_trait]
pub trait LocalDownloader: Send + Sync {
    /// Download the item described by `request` into `request.output_dir`
    async fn download_to_disk(&self, request: &TransferRequest) -> Result<LocalTransfer>;
}

/// Stores items in a remote bucket
#[async_trait]
pub trait RemoteStorage: Send + Sync {
    /// Fetch the item and stream it straight to `bucket/key`
    async fn stream_to_remote(
        &self,
        request: &TransferRequest,
        bucket: &str,
        key: &str,
    ) -> Result<RemoteTransfer>;

    /// Upload an existing local file to `bucket/key`
    async fn upload_file(&self, path: &Path, bucket: &str, key: &str) -> Result<RemoteTransfer>;
}
