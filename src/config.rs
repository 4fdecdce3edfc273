//! Configuration types for mass-dl

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{path::Path, path::PathBuf, time::Duration};

/// Concurrency ceilings and resource thresholds used for admission control
///
/// The CPU and memory limits are the "soft" limits: usage at or above
/// `warning_ratio` of either limit puts the monitor into warning, and usage at or
/// above `critical_percent` puts it into critical.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Maximum channel workers running at once (default: 3)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_channels: usize,

    /// Maximum item downloads running at once within one channel (default: 3)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_downloads: usize,

    /// Soft CPU limit in percent (default: 80.0)
    #[serde(default = "default_soft_limit")]
    pub max_cpu_percent: f64,

    /// Soft memory limit in percent (default: 80.0)
    #[serde(default = "default_soft_limit")]
    pub max_memory_percent: f64,

    /// Fraction of a soft limit at which load is classified as warning (default: 0.8)
    #[serde(default = "default_warning_ratio")]
    pub warning_ratio: f64,

    /// Hard ceiling in percent for either CPU or memory (default: 95.0)
    #[serde(default = "default_critical_percent")]
    pub critical_percent: f64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_concurrent_channels: default_max_concurrent(),
            max_concurrent_downloads: default_max_concurrent(),
            max_cpu_percent: default_soft_limit(),
            max_memory_percent: default_soft_limit(),
            warning_ratio: default_warning_ratio(),
            critical_percent: default_critical_percent(),
        }
    }
}

/// Coordinator behavior
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Run the download phase in the `*_with_downloads` entry points (default: false)
    #[serde(default)]
    pub download_videos: bool,

    /// Absorb download-phase faults instead of failing the channel (default: true)
    #[serde(default = "default_true")]
    pub continue_on_error: bool,

    /// Upper bound on items enumerated per channel (None = all)
    #[serde(default)]
    pub max_videos_per_channel: Option<usize>,

    /// Overall bound on time spent waiting for admission (None = wait indefinitely)
    #[serde(default, with = "optional_duration_serde")]
    pub job_timeout: Option<Duration>,

    /// Sleep between resource samples while admission is blocked (default: 500ms)
    #[serde(default = "default_admission_poll", with = "duration_ms_serde")]
    pub admission_poll_interval: Duration,

    /// Maximum time `shutdown()` waits for in-flight channel workers (default: 30s)
    #[serde(default = "default_shutdown_timeout", with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            download_videos: false,
            continue_on_error: true,
            max_videos_per_channel: None,
            job_timeout: None,
            admission_poll_interval: default_admission_poll(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Where downloaded items end up
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadMode {
    /// Stream straight into remote storage, never touching local disk (default)
    #[default]
    StreamToRemote,
    /// Download to local disk, then upload the file to remote storage
    LocalThenUpload,
    /// Download to local disk only
    LocalOnly,
}

impl DownloadMode {
    /// Whether this mode writes to remote storage and therefore needs a bucket
    pub fn requires_remote(&self) -> bool {
        matches!(self, DownloadMode::StreamToRemote | DownloadMode::LocalThenUpload)
    }

    /// Config-file spelling of the mode
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadMode::StreamToRemote => "stream_to_remote",
            DownloadMode::LocalThenUpload => "local_then_upload",
            DownloadMode::LocalOnly => "local_only",
        }
    }
}

impl std::fmt::Display for DownloadMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Download integration settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Transfer mode (default: stream_to_remote)
    #[serde(default)]
    pub download_mode: DownloadMode,

    /// Remote bucket, required for stream_to_remote and local_then_upload
    #[serde(default)]
    pub remote_bucket: Option<String>,

    /// Key prefix inside the bucket (default: "mass-download")
    #[serde(default = "default_remote_prefix")]
    pub remote_prefix: String,

    /// Local download directory (default: system temp dir + "mass-dl")
    #[serde(default = "default_local_download_dir")]
    pub local_download_dir: PathBuf,

    /// Delete the local file after a successful upload (default: true)
    #[serde(default = "default_true")]
    pub delete_after_upload: bool,

    /// Requested resolution, passed through to the transfer client (default: "720")
    #[serde(default = "default_resolution")]
    pub resolution: String,

    /// Container format, passed through to the transfer client (default: "mp4")
    #[serde(default = "default_format")]
    pub format: String,

    /// Fetch subtitles alongside the item (default: true)
    #[serde(default = "default_true")]
    pub include_subtitles: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_mode: DownloadMode::default(),
            remote_bucket: None,
            remote_prefix: default_remote_prefix(),
            local_download_dir: default_local_download_dir(),
            delete_after_upload: true,
            resolution: default_resolution(),
            format: default_format(),
            include_subtitles: true,
        }
    }
}

/// Retry behavior for external client calls
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first (default: 3)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the second attempt; doubles per attempt (default: 1000ms)
    #[serde(default = "default_base_delay", with = "duration_ms_serde")]
    pub base_delay: Duration,

    /// Maximum delay between attempts (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Add random jitter to delays (default: false)
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter: false,
        }
    }
}

/// Circuit breaker thresholds, shared by every operation key
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit (default: 5)
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time after the last failure before a trial call is allowed (default: 60 seconds)
    #[serde(default = "default_reset_timeout", with = "duration_serde")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout: default_reset_timeout(),
        }
    }
}

/// Persistence of processed identifiers, item records and failed items
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// SQLite database path (None = in-memory tracking only)
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// JSON file mirroring the dead-letter queue (None = kept in memory)
    #[serde(default)]
    pub dead_letter_path: Option<PathBuf>,

    /// Failed items kept for retry before the oldest is dropped (default: 1000)
    #[serde(default = "default_dead_letter_capacity")]
    pub dead_letter_capacity: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            dead_letter_path: None,
            dead_letter_capacity: default_dead_letter_capacity(),
        }
    }
}

/// Main configuration for the mass download coordinator
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Concurrency ceilings and resource thresholds
    #[serde(default)]
    pub limits: ResourceLimits,

    /// Coordinator behavior
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Download integration settings
    #[serde(default)]
    pub download: DownloadConfig,

    /// Retry behavior for external client calls
    #[serde(default)]
    pub retry: RetryConfig,

    /// Circuit breaker thresholds
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Persistence settings
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl Config {
    /// Load configuration from a JSON file and validate it
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values that cannot work
    pub fn validate(&self) -> Result<()> {
        let limits = &self.limits;
        if limits.max_concurrent_channels == 0 {
            return Err(Error::config(
                "max_concurrent_channels",
                "max_concurrent_channels must be at least 1",
            ));
        }
        if limits.max_concurrent_downloads == 0 {
            return Err(Error::config(
                "max_concurrent_downloads",
                "max_concurrent_downloads must be at least 1",
            ));
        }
        for (key, value) in [
            ("max_cpu_percent", limits.max_cpu_percent),
            ("max_memory_percent", limits.max_memory_percent),
            ("critical_percent", limits.critical_percent),
        ] {
            if !(value > 0.0 && value <= 100.0) {
                return Err(Error::config(
                    key,
                    format!("{key} must be in (0, 100], got {value}"),
                ));
            }
        }
        if limits.critical_percent < limits.max_cpu_percent
            || limits.critical_percent < limits.max_memory_percent
        {
            return Err(Error::config(
                "critical_percent",
                "critical_percent must not be below the CPU or memory limit",
            ));
        }
        if !(limits.warning_ratio > 0.0 && limits.warning_ratio <= 1.0) {
            return Err(Error::config(
                "warning_ratio",
                format!("warning_ratio must be in (0, 1], got {}", limits.warning_ratio),
            ));
        }
        if self.retry.max_retries == 0 {
            return Err(Error::config("max_retries", "max_retries must be at least 1"));
        }
        if self.persistence.dead_letter_capacity == 0 {
            return Err(Error::config(
                "dead_letter_capacity",
                "dead_letter_capacity must be at least 1",
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(Error::config(
                "failure_threshold",
                "failure_threshold must be at least 1",
            ));
        }
        self.download.validate()
    }
}

impl DownloadConfig {
    /// Fail fast when a remote mode has no bucket to write to
    pub fn validate(&self) -> Result<()> {
        let has_bucket = self
            .remote_bucket
            .as_deref()
            .is_some_and(|b| !b.trim().is_empty());
        if self.download_mode.requires_remote() && !has_bucket {
            return Err(Error::config(
                "remote_bucket",
                format!("remote bucket is required for mode {}", self.download_mode),
            ));
        }
        Ok(())
    }
}

fn default_max_concurrent() -> usize {
    3
}

fn default_soft_limit() -> f64 {
    80.0
}

fn default_warning_ratio() -> f64 {
    0.8
}

fn default_critical_percent() -> f64 {
    95.0
}

fn default_true() -> bool {
    true
}

fn default_admission_poll() -> Duration {
    Duration::from_millis(500)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_remote_prefix() -> String {
    "mass-download".to_string()
}

fn default_local_download_dir() -> PathBuf {
    std::env::temp_dir().join("mass-dl")
}

fn default_resolution() -> String {
    "720".to_string()
}

fn default_format() -> String {
    "mp4".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_dead_letter_capacity() -> usize {
    crate::recovery::DEFAULT_DEAD_LETTER_CAPACITY
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Duration serialization helper (milliseconds, for short poll/backoff delays)
mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

// Optional Duration serialization helper
mod optional_duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn local_only() -> Config {
        Config {
            download: DownloadConfig {
                download_mode: DownloadMode::LocalOnly,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.limits.max_concurrent_channels, 3);
        assert_eq!(config.limits.max_concurrent_downloads, 3);
        assert_eq!(config.limits.critical_percent, 95.0);
        assert!(config.coordinator.continue_on_error);
        assert!(!config.coordinator.download_videos);
        assert_eq!(config.download.download_mode, DownloadMode::StreamToRemote);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.persistence.dead_letter_capacity, 1000);
        assert!(config.persistence.dead_letter_path.is_none());
    }

    #[test]
    fn zero_dead_letter_capacity_is_rejected() {
        let mut config = local_only();
        config.persistence.dead_letter_capacity = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("dead_letter_capacity"));
    }

    #[test]
    fn default_stream_mode_requires_bucket() {
        let err = Config::default().validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "configuration error: remote bucket is required for mode stream_to_remote"
        );
    }

    #[test]
    fn blank_bucket_is_rejected_for_upload_mode() {
        let download = DownloadConfig {
            download_mode: DownloadMode::LocalThenUpload,
            remote_bucket: Some("   ".to_string()),
            ..Default::default()
        };
        let err = download.validate().unwrap_err();
        assert!(err.to_string().contains("local_then_upload"));
    }

    #[test]
    fn local_only_needs_no_bucket() {
        assert!(local_only().validate().is_ok());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let mut config = local_only();
        config.limits.max_concurrent_channels = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn critical_below_soft_limit_is_rejected() {
        let mut config = local_only();
        config.limits.critical_percent = 70.0;
        let err = config.validate().unwrap_err();
        match err {
            Error::Config { key, .. } => assert_eq!(key.as_deref(), Some("critical_percent")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn deserializes_partial_json_with_defaults() {
        let json = r#"{
            "limits": { "max_concurrent_channels": 8 },
            "download": { "download_mode": "local_then_upload", "remote_bucket": "archive" },
            "retry": { "base_delay": 250 },
            "coordinator": { "job_timeout": 120 }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.limits.max_concurrent_channels, 8);
        assert_eq!(config.limits.max_concurrent_downloads, 3);
        assert_eq!(config.download.download_mode, DownloadMode::LocalThenUpload);
        assert_eq!(config.retry.base_delay, Duration::from_millis(250));
        assert_eq!(config.coordinator.job_timeout, Some(Duration::from_secs(120)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn load_reads_and_validates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "download": { "download_mode": "local_only" } }"#).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.download.download_mode, DownloadMode::LocalOnly);

        std::fs::write(&path, r#"{ "download": { "download_mode": "stream_to_remote" } }"#)
            .unwrap();
        assert!(Config::load(&path).is_err());
    }
}
