//! Fake external clients and coordinator builders

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use mass_dl::clients::{
    ChannelEnumerator, LocalDownloader, LocalTransfer, RemoteStorage, RemoteTransfer,
    TransferRequest,
};
use mass_dl::config::RetryConfig;
use mass_dl::resources::ResourceSampler;
use mass_dl::{
    ChannelInfo, Collaborators, Config, DownloadMode, Error, MassDownloadCoordinator,
    PersonRecord, Result, VideoMetadata,
};

/// Enumerator serving a fixed set of channels, each after `delay`
pub struct StaticEnumerator {
    pub channels: HashMap<String, Vec<String>>,
    pub delay: Duration,
    pub calls: Arc<AtomicU32>,
}

impl StaticEnumerator {
    /// `channels` maps a channel URL to its item ids
    pub fn new(channels: &[(&str, &[&str])], delay: Duration) -> Self {
        Self {
            channels: channels
                .iter()
                .map(|(url, ids)| {
                    (
                        url.to_string(),
                        ids.iter().map(|id| id.to_string()).collect(),
                    )
                })
                .collect(),
            delay,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }
}

#[async_trait]
impl ChannelEnumerator for StaticEnumerator {
    async fn extract_channel_info(&self, channel_url: &str) -> Result<Option<ChannelInfo>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(self.channels.get(channel_url).map(|ids| ChannelInfo {
            channel_id: channel_url.rsplit('/').next().unwrap_or_default().to_string(),
            title: format!("Channel {channel_url}"),
            subscriber_count: None,
            video_count: Some(ids.len() as u64),
        }))
    }

    async fn enumerate_items(
        &self,
        channel_url: &str,
        max_items: Option<usize>,
    ) -> Result<Vec<VideoMetadata>> {
        let ids = self
            .channels
            .get(channel_url)
            .ok_or_else(|| Error::NotFound(channel_url.to_string()))?;
        Ok(ids
            .iter()
            .take(max_items.unwrap_or(usize::MAX))
            .map(|id| VideoMetadata {
                video_id: id.clone(),
                title: format!("Video {id}"),
                duration_secs: Some(90),
                upload_date: None,
                view_count: Some(1),
                description: None,
                channel_id: channel_url.to_string(),
                uploader: None,
                url: format!("https://www.youtube.com/watch?v={id}"),
            })
            .collect())
    }
}

/// Local downloader writing small files, optionally lying about some of them
#[derive(Default)]
pub struct DiskDownloader {
    pub calls: Arc<AtomicU32>,
    /// Ids reported as downloaded to a path that is never written
    pub phantom: HashSet<String>,
    pub delay: Duration,
}

#[async_trait]
impl LocalDownloader for DiskDownloader {
    async fn download_to_disk(&self, request: &TransferRequest) -> Result<LocalTransfer> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let path = request
            .output_dir
            .join(format!("{}.{}", request.video_id, request.format));
        if !self.phantom.contains(&request.video_id) {
            tokio::fs::write(&path, request.url.as_bytes()).await?;
        }
        Ok(LocalTransfer {
            success: true,
            path: Some(path),
            error: None,
        })
    }
}

/// Remote store that accepts everything
#[derive(Default)]
pub struct MemoryStorage {
    pub stored: Arc<tokio::sync::Mutex<Vec<String>>>,
}

#[async_trait]
impl RemoteStorage for MemoryStorage {
    async fn stream_to_remote(
        &self,
        _request: &TransferRequest,
        bucket: &str,
        key: &str,
    ) -> Result<RemoteTransfer> {
        let path = format!("s3://{bucket}/{key}");
        self.stored.lock().await.push(path.clone());
        Ok(RemoteTransfer {
            success: true,
            remote_path: Some(path),
            size_bytes: Some(1024),
            error: None,
        })
    }

    async fn upload_file(&self, path: &Path, bucket: &str, key: &str) -> Result<RemoteTransfer> {
        let size = tokio::fs::metadata(path).await?.len();
        let remote = format!("s3://{bucket}/{key}");
        self.stored.lock().await.push(remote.clone());
        Ok(RemoteTransfer {
            success: true,
            remote_path: Some(remote),
            size_bytes: Some(size),
            error: None,
        })
    }
}

/// Sampler reporting a constant, comfortable load
pub struct IdleSampler;

impl ResourceSampler for IdleSampler {
    fn sample(&self) -> Result<(f64, f64)> {
        Ok((5.0, 20.0))
    }
}

/// Local-only configuration rooted in `dir`, with fast retries
pub fn local_config(dir: &TempDir, download_videos: bool) -> Config {
    let mut config = Config::default();
    config.download.download_mode = DownloadMode::LocalOnly;
    config.download.local_download_dir = dir.path().join("downloads");
    config.coordinator.download_videos = download_videos;
    config.coordinator.admission_poll_interval = Duration::from_millis(10);
    config.retry = RetryConfig {
        max_retries: 2,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        jitter: false,
    };
    config
}

/// Build a coordinator with an idle sampler
pub async fn build_coordinator(
    config: Config,
    enumerator: StaticEnumerator,
    local: DiskDownloader,
    remote: Option<MemoryStorage>,
) -> MassDownloadCoordinator {
    MassDownloadCoordinator::new(
        config,
        Collaborators {
            enumerator: Arc::new(enumerator),
            local: Arc::new(local),
            remote: remote.map(|r| Arc::new(r) as Arc<dyn RemoteStorage>),
            sampler: Some(Arc::new(IdleSampler)),
        },
    )
    .await
    .unwrap()
}

/// Person owning `channel_url`
pub fn owner(name: &str, channel_url: &str) -> PersonRecord {
    PersonRecord::new(name, format!("{name}@example.com"), "creator", channel_url)
}

/// (person, url) pairs for the given channel URLs
pub fn channel_pairs(urls: &[&str]) -> Vec<(PersonRecord, String)> {
    urls.iter()
        .enumerate()
        .map(|(i, url)| (owner(&format!("owner{i}"), url), url.to_string()))
        .collect()
}
