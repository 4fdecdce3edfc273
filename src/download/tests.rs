use super::*;
use crate::circuit_breaker::CircuitBreaker;
use crate::clients::{LocalTransfer, RemoteTransfer};
use crate::config::{CircuitBreakerConfig, RetryConfig};
use crate::types::{DownloadStatus, VideoMetadata};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

#[derive(Default)]
struct FakeLocal {
    calls: Arc<AtomicU32>,
    /// Ids reported as written to a path that does not exist
    phantom: HashSet<String>,
    /// Ids the client refuses with a reported failure
    rejected: HashSet<String>,
    /// Ids that fail with a permanent error
    gone: HashSet<String>,
    /// Number of leading calls that time out
    transient_failures: AtomicU32,
    delays: HashMap<String, Duration>,
}

#[async_trait]
impl LocalDownloader for FakeLocal {
    async fn download_to_disk(&self, request: &TransferRequest) -> Result<LocalTransfer> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delays.get(&request.video_id) {
            tokio::time::sleep(*delay).await;
        }
        if self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Timeout("read timed out".into()));
        }
        if self.gone.contains(&request.video_id) {
            return Err(Error::NotFound("video removed".into()));
        }
        if self.rejected.contains(&request.video_id) {
            return Ok(LocalTransfer {
                success: false,
                path: None,
                error: Some("HTTP Error 403: Forbidden".into()),
            });
        }
        let path = request
            .output_dir
            .join(format!("{}.{}", request.video_id, request.format));
        if !self.phantom.contains(&request.video_id) {
            tokio::fs::write(&path, b"video bytes").await?;
        }
        Ok(LocalTransfer {
            success: true,
            path: Some(path),
            error: None,
        })
    }
}

#[derive(Default)]
struct FakeRemote {
    streams: Arc<AtomicU32>,
    uploads: Arc<AtomicU32>,
    stream_error: Option<String>,
    upload_error: Option<String>,
}

#[async_trait]
impl RemoteStorage for FakeRemote {
    async fn stream_to_remote(
        &self,
        _request: &TransferRequest,
        bucket: &str,
        key: &str,
    ) -> Result<RemoteTransfer> {
        self.streams.fetch_add(1, Ordering::SeqCst);
        Ok(match &self.stream_error {
            Some(error) => RemoteTransfer {
                success: false,
                error: Some(error.clone()),
                ..Default::default()
            },
            None => RemoteTransfer {
                success: true,
                remote_path: Some(format!("s3://{bucket}/{key}")),
                size_bytes: Some(4096),
                error: None,
            },
        })
    }

    async fn upload_file(&self, path: &Path, bucket: &str, key: &str) -> Result<RemoteTransfer> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        assert!(path.exists(), "upload must be given an existing file");
        Ok(match &self.upload_error {
            Some(error) => RemoteTransfer {
                success: false,
                error: Some(error.clone()),
                ..Default::default()
            },
            None => RemoteTransfer {
                success: true,
                remote_path: Some(format!("s3://{bucket}/{key}")),
                size_bytes: None,
                error: None,
            },
        })
    }
}

fn retry() -> RetryExecutor {
    let config = RetryConfig {
        max_retries: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        jitter: false,
    };
    RetryExecutor::new(
        config,
        Arc::new(CircuitBreaker::new(&CircuitBreakerConfig::default())),
    )
}

fn config(mode: DownloadMode, dir: &TempDir) -> DownloadConfig {
    DownloadConfig {
        download_mode: mode,
        remote_bucket: mode.requires_remote().then(|| "archive".to_string()),
        local_download_dir: dir.path().to_path_buf(),
        ..Default::default()
    }
}

fn integration(
    mode: DownloadMode,
    dir: &TempDir,
    local: FakeLocal,
    remote: FakeRemote,
) -> DownloadIntegration {
    DownloadIntegration::new(
        config(mode, dir),
        retry(),
        Arc::new(local),
        Some(Arc::new(remote)),
    )
    .unwrap()
}

fn item(id: &str) -> PendingItemRecord {
    let video = VideoMetadata {
        video_id: id.to_string(),
        title: format!("Video {id}"),
        duration_secs: Some(60),
        upload_date: None,
        view_count: None,
        description: None,
        channel_id: "UC1".to_string(),
        uploader: None,
        url: format!("https://example.com/watch?v={id}"),
    };
    PendingItemRecord::new("owner@example.com", &video, None).unwrap()
}

#[test]
fn construction_requires_bucket_for_remote_modes() {
    let dir = TempDir::new().unwrap();
    for mode in [DownloadMode::StreamToRemote, DownloadMode::LocalThenUpload] {
        let mut cfg = config(mode, &dir);
        cfg.remote_bucket = None;
        let err = DownloadIntegration::new(
            cfg,
            retry(),
            Arc::new(FakeLocal::default()),
            Some(Arc::new(FakeRemote::default())),
        )
        .err()
        .unwrap();
        assert!(
            err.to_string()
                .contains(&format!("remote bucket is required for mode {mode}"))
        );
    }
}

#[test]
fn construction_requires_storage_client_for_remote_modes() {
    let dir = TempDir::new().unwrap();
    let result = DownloadIntegration::new(
        config(DownloadMode::StreamToRemote, &dir),
        retry(),
        Arc::new(FakeLocal::default()),
        None,
    );
    assert!(matches!(result, Err(Error::Config { .. })));

    assert!(
        DownloadIntegration::new(
            config(DownloadMode::LocalOnly, &dir),
            retry(),
            Arc::new(FakeLocal::default()),
            None,
        )
        .is_ok()
    );
}

#[test]
fn remote_key_layout() {
    let dir = TempDir::new().unwrap();
    let integration = integration(
        DownloadMode::StreamToRemote,
        &dir,
        FakeLocal::default(),
        FakeRemote::default(),
    );
    let record = item("abc");
    assert_eq!(
        integration.remote_key(&record),
        format!("mass-download/abc_{}.mp4", record.uuid)
    );
}

#[test]
fn sanitize_owner_directory_names() {
    assert_eq!(sanitize_path_component("jane@example.com"), "jane@example.com");
    assert_eq!(sanitize_path_component("Jane Doe/../x"), "Jane_Doe_.._x");
    assert_eq!(sanitize_path_component(".."), "unknown");
    assert_eq!(sanitize_path_component("   "), "unknown");
}

#[tokio::test]
async fn local_only_completes_with_size() {
    let dir = TempDir::new().unwrap();
    let integration = integration(
        DownloadMode::LocalOnly,
        &dir,
        FakeLocal::default(),
        FakeRemote::default(),
    );
    let result = integration.download_one(&item("abc")).await;
    assert_eq!(result.status(), DownloadStatus::Completed);
    assert_eq!(result.file_size(), Some(11));
    assert_eq!(result.download_mode(), Some(DownloadMode::LocalOnly));
    let path = result.local_path().unwrap();
    assert!(path.starts_with(dir.path().join("owner@example.com")));
    assert!(path.exists());
}

#[tokio::test]
async fn claimed_file_that_does_not_exist_fails() {
    let dir = TempDir::new().unwrap();
    let local = FakeLocal {
        phantom: HashSet::from(["abc".to_string()]),
        ..Default::default()
    };
    let integration = integration(DownloadMode::LocalOnly, &dir, local, FakeRemote::default());
    let result = integration.download_one(&item("abc")).await;
    assert_eq!(result.status(), DownloadStatus::Failed);
    let message = result.error_message().unwrap();
    assert!(message.contains("not found"), "{message}");
}

#[tokio::test]
async fn reported_client_failure_carries_client_message() {
    let dir = TempDir::new().unwrap();
    let local = FakeLocal {
        rejected: HashSet::from(["abc".to_string()]),
        ..Default::default()
    };
    let calls = Arc::clone(&local.calls);
    let integration = integration(DownloadMode::LocalOnly, &dir, local, FakeRemote::default());
    let result = integration.download_one(&item("abc")).await;
    assert_eq!(result.status(), DownloadStatus::Failed);
    assert_eq!(result.error_message(), Some("HTTP Error 403: Forbidden"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stream_to_remote_never_touches_disk() {
    let dir = TempDir::new().unwrap();
    let local = FakeLocal::default();
    let local_calls = Arc::clone(&local.calls);
    let remote = FakeRemote::default();
    let streams = Arc::clone(&remote.streams);
    let integration = integration(DownloadMode::StreamToRemote, &dir, local, remote);

    let record = item("abc");
    let result = integration.download_one(&record).await;
    assert_eq!(result.status(), DownloadStatus::Completed);
    assert_eq!(
        result.remote_path(),
        Some(format!("s3://archive/mass-download/abc_{}.mp4", record.uuid).as_str())
    );
    assert_eq!(result.file_size(), Some(4096));
    assert!(result.local_path().is_none());
    assert_eq!(streams.load(Ordering::SeqCst), 1);
    assert_eq!(local_calls.load(Ordering::SeqCst), 0);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn stream_failure_reports_client_error() {
    let dir = TempDir::new().unwrap();
    let remote = FakeRemote {
        stream_error: Some("AccessDenied".into()),
        ..Default::default()
    };
    let integration = integration(DownloadMode::StreamToRemote, &dir, FakeLocal::default(), remote);
    let result = integration.download_one(&item("abc")).await;
    assert_eq!(result.status(), DownloadStatus::Failed);
    assert_eq!(result.error_message(), Some("AccessDenied"));
}

#[tokio::test]
async fn local_then_upload_deletes_after_upload() {
    let dir = TempDir::new().unwrap();
    let remote = FakeRemote::default();
    let uploads = Arc::clone(&remote.uploads);
    let integration = integration(DownloadMode::LocalThenUpload, &dir, FakeLocal::default(), remote);

    let result = integration.download_one(&item("abc")).await;
    assert_eq!(result.status(), DownloadStatus::Completed);
    assert!(result.remote_path().unwrap().starts_with("s3://archive/"));
    assert_eq!(result.file_size(), Some(11));
    assert!(result.local_path().is_none());
    assert_eq!(uploads.load(Ordering::SeqCst), 1);
    assert!(!dir.path().join("owner@example.com/abc.mp4").exists());
}

#[tokio::test]
async fn local_then_upload_keeps_file_when_configured() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config(DownloadMode::LocalThenUpload, &dir);
    cfg.delete_after_upload = false;
    let integration = DownloadIntegration::new(
        cfg,
        retry(),
        Arc::new(FakeLocal::default()),
        Some(Arc::new(FakeRemote::default())),
    )
    .unwrap();
    let result = integration.download_one(&item("abc")).await;
    assert!(result.is_completed());
    assert!(result.local_path().unwrap().exists());
}

#[tokio::test]
async fn upload_failure_keeps_local_file() {
    let dir = TempDir::new().unwrap();
    let remote = FakeRemote {
        upload_error: Some("bucket quota exceeded".into()),
        ..Default::default()
    };
    let integration = integration(DownloadMode::LocalThenUpload, &dir, FakeLocal::default(), remote);
    let result = integration.download_one(&item("abc")).await;
    assert_eq!(result.status(), DownloadStatus::Failed);
    assert_eq!(result.error_message(), Some("bucket quota exceeded"));
    assert!(result.local_path().unwrap().exists());
}

#[tokio::test]
async fn phantom_file_is_never_uploaded() {
    let dir = TempDir::new().unwrap();
    let local = FakeLocal {
        phantom: HashSet::from(["abc".to_string()]),
        ..Default::default()
    };
    let remote = FakeRemote::default();
    let uploads = Arc::clone(&remote.uploads);
    let integration = integration(DownloadMode::LocalThenUpload, &dir, local, remote);
    let result = integration.download_one(&item("abc")).await;
    assert_eq!(result.status(), DownloadStatus::Failed);
    assert_eq!(uploads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn transient_errors_are_retried() {
    let dir = TempDir::new().unwrap();
    let local = FakeLocal {
        transient_failures: AtomicU32::new(2),
        ..Default::default()
    };
    let calls = Arc::clone(&local.calls);
    let integration = integration(DownloadMode::LocalOnly, &dir, local, FakeRemote::default());
    let result = integration.download_one(&item("abc")).await;
    assert!(result.is_completed());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn exhausted_retries_become_failed_result() {
    let dir = TempDir::new().unwrap();
    let local = FakeLocal {
        transient_failures: AtomicU32::new(10),
        ..Default::default()
    };
    let integration = integration(DownloadMode::LocalOnly, &dir, local, FakeRemote::default());
    let result = integration.download_one(&item("abc")).await;
    assert_eq!(result.status(), DownloadStatus::Failed);
    assert!(result.error_message().unwrap().contains("after 3 attempts"));
}

#[tokio::test]
async fn permanent_errors_are_not_retried() {
    let dir = TempDir::new().unwrap();
    let local = FakeLocal {
        gone: HashSet::from(["abc".to_string()]),
        ..Default::default()
    };
    let calls = Arc::clone(&local.calls);
    let integration = integration(DownloadMode::LocalOnly, &dir, local, FakeRemote::default());
    let result = integration.download_one(&item("abc")).await;
    assert_eq!(result.status(), DownloadStatus::Failed);
    assert!(result.error_message().unwrap().contains("video removed"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn batch_of_nothing_is_empty() {
    let dir = TempDir::new().unwrap();
    let integration = integration(
        DownloadMode::LocalOnly,
        &dir,
        FakeLocal::default(),
        FakeRemote::default(),
    );
    let results = integration.batch_download(&mut [], 3).await.unwrap();
    assert!(results.is_empty());
}

#[tokio::test]
async fn batch_preserves_input_order_and_mirrors_status() {
    let dir = TempDir::new().unwrap();
    // Earlier items finish last
    let delays = HashMap::from([
        ("a".to_string(), Duration::from_millis(60)),
        ("b".to_string(), Duration::from_millis(30)),
        ("c".to_string(), Duration::from_millis(0)),
    ]);
    let local = FakeLocal {
        delays,
        rejected: HashSet::from(["b".to_string()]),
        ..Default::default()
    };
    let integration = integration(DownloadMode::LocalOnly, &dir, local, FakeRemote::default());

    let mut items = vec![item("a"), item("b"), item("c"), item("d")];
    let results = integration.batch_download(&mut items, 4).await.unwrap();

    let ids: Vec<_> = results.iter().map(|r| r.video_id()).collect();
    assert_eq!(ids, vec!["a", "b", "c", "d"]);
    let statuses: Vec<_> = items.iter().map(|i| i.download_status).collect();
    assert_eq!(
        statuses,
        vec![
            DownloadStatus::Completed,
            DownloadStatus::Failed,
            DownloadStatus::Completed,
            DownloadStatus::Completed
        ]
    );
    assert_eq!(items[1].error_message.as_deref(), Some("HTTP Error 403: Forbidden"));
    assert_eq!(items[0].file_size, Some(11));
}

#[tokio::test]
async fn batch_respects_concurrency_limit() {
    let dir = TempDir::new().unwrap();
    let delays = (0..4)
        .map(|i| (format!("v{i}"), Duration::from_millis(50)))
        .collect();
    let local = FakeLocal {
        delays,
        ..Default::default()
    };
    let integration = integration(DownloadMode::LocalOnly, &dir, local, FakeRemote::default());
    let mut items: Vec<_> = (0..4).map(|i| item(&format!("v{i}"))).collect();

    let start = std::time::Instant::now();
    integration.batch_download(&mut items, 2).await.unwrap();
    // Two waves of 50ms
    assert!(start.elapsed() >= Duration::from_millis(100));
}

#[tokio::test]
async fn cancelled_batch_leaves_items_pending() {
    let dir = TempDir::new().unwrap();
    let integration = integration(
        DownloadMode::LocalOnly,
        &dir,
        FakeLocal::default(),
        FakeRemote::default(),
    );
    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut items = vec![item("a"), item("b")];
    let gate = Arc::new(AdmissionGate::unmonitored("downloads", 2));
    let results = integration
        .batch_download_gated(&mut items, gate, &cancel, None)
        .await
        .unwrap();
    assert!(results.iter().all(|r| r.status() == DownloadStatus::Pending));
    assert_eq!(results[0].error_message(), Some(CANCELLED_BEFORE_START));
    assert_eq!(items[1].download_status, DownloadStatus::Pending);
}

#[tokio::test]
async fn records_only_ever_show_final_status() {
    let dir = TempDir::new().unwrap();
    let local = FakeLocal {
        delays: HashMap::from([("a".to_string(), Duration::from_millis(80))]),
        ..Default::default()
    };
    let integration = integration(DownloadMode::LocalOnly, &dir, local, FakeRemote::default());
    let gate = Arc::new(AdmissionGate::unmonitored("downloads", 1));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let mut items = vec![item("a"), item("b"), item("c")];
    integration
        .batch_download_gated(&mut items, gate, &cancel, None)
        .await
        .unwrap();

    // "a" was mid-transfer when the batch was cancelled; the rest never started
    let statuses: Vec<_> = items.iter().map(|i| i.download_status).collect();
    assert_eq!(
        statuses,
        vec![
            DownloadStatus::Completed,
            DownloadStatus::Pending,
            DownloadStatus::Pending
        ]
    );
    assert!(items.iter().all(|i| i.download_status != DownloadStatus::Downloading));
}

#[tokio::test]
async fn admission_timeout_fails_item() {
    let dir = TempDir::new().unwrap();
    let integration = integration(
        DownloadMode::LocalOnly,
        &dir,
        FakeLocal::default(),
        FakeRemote::default(),
    );
    let gate = Arc::new(AdmissionGate::unmonitored("downloads", 1));
    let cancel = CancellationToken::new();
    let _held = gate.admit(&cancel, None).await.unwrap();

    let mut items = vec![item("a")];
    let results = integration
        .batch_download_gated(&mut items, gate, &cancel, Some(Duration::from_millis(20)))
        .await
        .unwrap();
    assert_eq!(results[0].status(), DownloadStatus::Failed);
    assert_eq!(results[0].error_message(), Some("admission timed out"));
}

#[test]
fn stats_aggregate() {
    let a = item("a");
    let b = item("b");
    let results = vec![
        DownloadResult::completed(&a),
        DownloadResult::failed(&b, "x"),
        DownloadResult::completed(&b),
        DownloadResult::not_started(&a, CANCELLED_BEFORE_START),
    ];
    let stats = DownloadIntegration::stats(&results);
    assert_eq!(stats.total, 4);
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.success_rate, 50.0);

    let empty = DownloadIntegration::stats(&[]);
    assert_eq!(empty.total, 0);
    assert_eq!(empty.success_rate, 0.0);
}
