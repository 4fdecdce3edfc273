//! Mass download coordinator split into focused submodules.
//!
//! The [`MassDownloadCoordinator`] struct and its methods are organized by domain:
//! - [`channel`] - Per-channel state machine (discover, filter, download)
//! - [`concurrent`] - Bounded fan-out over many channels
//! - [`lifecycle`] - Progress reporting, cancellation and shutdown
//! - [`recovery`] - Dead-letter retries and the recovery report

mod channel;
mod concurrent;
mod lifecycle;
mod recovery;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::clients::{ChannelEnumerator, LocalDownloader, RemoteStorage};
use crate::config::Config;
use crate::db::Database;
use crate::discovery::ChannelDiscovery;
use crate::download::DownloadIntegration;
use crate::duplicates::DuplicateTracker;
use crate::error::{Error, Result};
use crate::progress::ProgressTracker;
use crate::recovery::DeadLetterQueue;
use crate::resources::{
    AdmissionGate, ResourceMetrics, ResourceMonitor, ResourceSampler, SystemSampler,
};
use crate::retry::RetryExecutor;
use crate::types::Event;

/// External clients the coordinator drives
pub struct Collaborators {
    /// Channel metadata and item enumeration
    pub enumerator: Arc<dyn ChannelEnumerator>,
    /// Download-to-disk client
    pub local: Arc<dyn LocalDownloader>,
    /// Remote storage client (required for remote download modes)
    pub remote: Option<Arc<dyn RemoteStorage>>,
    /// CPU/memory source for admission control; the operating system when None
    pub sampler: Option<Arc<dyn ResourceSampler>>,
}

/// Turns channel URLs into concurrent, resource-bounded download jobs
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct MassDownloadCoordinator {
    config: Arc<Config>,
    discovery: ChannelDiscovery,
    downloads: DownloadIntegration,
    tracker: Arc<DuplicateTracker>,
    progress: Arc<ProgressTracker>,
    breaker: Arc<CircuitBreaker>,
    monitor: Arc<ResourceMonitor>,
    /// Outer pool: whole-channel jobs
    channel_gate: Arc<AdmissionGate>,
    db: Option<Arc<Database>>,
    dead_letters: Arc<DeadLetterQueue>,
    event_tx: broadcast::Sender<Event>,
    /// Cancelled by shutdown, or when a caller-supplied parent token fires
    root_cancel: CancellationToken,
    /// Child of `root_cancel` shared by the runs in flight; replaced once cancelled
    run_cancel: Arc<Mutex<CancellationToken>>,
    accepting: Arc<AtomicBool>,
}

impl MassDownloadCoordinator {
    /// Build a coordinator from validated configuration
    ///
    /// When `persistence.database_path` is set the database is opened (and
    /// migrated) and every previously processed item id is loaded into the
    /// duplicate tracker.
    ///
    /// # Errors
    ///
    /// Configuration errors (including a missing bucket for remote modes) and
    /// database failures.
    pub async fn new(config: Config, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let breaker = Arc::new(CircuitBreaker::new(&config.circuit_breaker));
        let retry = RetryExecutor::new(config.retry.clone(), Arc::clone(&breaker));
        let downloads = DownloadIntegration::new(
            config.download.clone(),
            retry,
            collaborators.local,
            collaborators.remote,
        )?;

        let tracker = Arc::new(DuplicateTracker::new());
        let discovery = ChannelDiscovery::new(collaborators.enumerator, Arc::clone(&tracker));
        let progress = Arc::new(ProgressTracker::new());

        let sampler = collaborators
            .sampler
            .unwrap_or_else(|| Arc::new(SystemSampler::new()));
        let monitor = Arc::new(ResourceMonitor::new(config.limits.clone(), sampler));
        let channel_gate = Arc::new(
            AdmissionGate::new(
                "channels",
                config.limits.max_concurrent_channels,
                Some(Arc::clone(&monitor)),
                config.coordinator.admission_poll_interval,
            )
            .with_progress(Arc::clone(&progress)),
        );

        let db = match &config.persistence.database_path {
            Some(path) => {
                let db = Database::new(path).await?;
                let processed = db.processed_items().await?;
                let loaded = tracker.load_existing_with_uuids(processed).await;
                tracing::info!(loaded, "Loaded processed items from database");
                Some(Arc::new(db))
            }
            None => None,
        };

        let capacity = config.persistence.dead_letter_capacity;
        let dead_letters = Arc::new(match &config.persistence.dead_letter_path {
            Some(path) => DeadLetterQueue::open(capacity, path.clone()).await,
            None => DeadLetterQueue::new(capacity),
        });

        // Buffer enough events for slow subscribers during large runs
        let (event_tx, _rx) = broadcast::channel(1000);

        let root_cancel = CancellationToken::new();
        tracing::info!(
            max_channels = config.limits.max_concurrent_channels,
            max_downloads = config.limits.max_concurrent_downloads,
            mode = %config.download.download_mode,
            download_videos = config.coordinator.download_videos,
            "Mass download coordinator initialized"
        );

        Ok(Self {
            config: Arc::new(config),
            discovery,
            downloads,
            tracker,
            progress,
            breaker,
            monitor,
            channel_gate,
            db,
            dead_letters,
            event_tx,
            run_cancel: Arc::new(Mutex::new(root_cancel.child_token())),
            root_cancel,
            accepting: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Subscribe to coordinator events
    ///
    /// Each receiver gets every event sent after it subscribed. A receiver that
    /// falls more than 1000 events behind sees `RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The run-wide duplicate tracker
    ///
    /// Callers with their own record of processed items can seed it with
    /// [`DuplicateTracker::load_existing`] before starting a run.
    pub fn duplicate_tracker(&self) -> &Arc<DuplicateTracker> {
        &self.tracker
    }

    /// The download integration used for item transfers
    pub fn download_integration(&self) -> &DownloadIntegration {
        &self.downloads
    }

    /// Current circuit state of every operation seen so far
    pub async fn circuit_states(&self) -> Vec<(String, CircuitState)> {
        self.breaker.snapshot().await
    }

    /// Take a resource sample now
    pub fn resource_metrics(&self) -> Result<ResourceMetrics> {
        self.monitor.sample()
    }

    fn ensure_accepting(&self) -> Result<()> {
        if self.accepting.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::ShuttingDown)
        }
    }

    /// Attach a caller-owned cancellation token
    ///
    /// Cancelling `token` cancels every run in flight and makes later calls
    /// fail with [`Error::Cancelled`]. Shutdown does not cancel `token` itself.
    /// Call before cloning the coordinator; existing clones keep their tokens.
    pub fn with_cancellation(mut self, token: &CancellationToken) -> Self {
        self.root_cancel = token.child_token();
        self.run_cancel = Arc::new(Mutex::new(self.root_cancel.child_token()));
        self
    }

    /// Token for a new run, replacing the shared one if it was cancelled
    fn begin_run_token(&self) -> Result<CancellationToken> {
        if self.root_cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let mut run = self.run_cancel.lock().unwrap_or_else(PoisonError::into_inner);
        if run.is_cancelled() {
            *run = self.root_cancel.child_token();
        }
        Ok(run.clone())
    }

    fn current_run_token(&self) -> CancellationToken {
        self.run_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn emit(&self, event: Event) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }
}
