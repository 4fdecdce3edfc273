//! Dead-letter queue for failed item downloads, and the recovery report.
//!
//! Items whose download ends `failed` are parked here with the error that
//! ended them. [`MassDownloadCoordinator::retry_failed_operations`] drains the
//! queue and tries each item again; items that fail once more come back with
//! their retry count bumped.
//!
//! When a persistence path is configured the queue is written to it as JSON
//! after every change and reloaded on startup.
//!
//! [`MassDownloadCoordinator::retry_failed_operations`]: crate::MassDownloadCoordinator::retry_failed_operations

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::circuit_breaker::CircuitState;
use crate::error::Result;
use crate::types::PendingItemRecord;

/// Default number of entries kept before the oldest is evicted
pub const DEFAULT_DEAD_LETTER_CAPACITY: usize = 1000;

/// Number of recent errors included in a [`RecoveryReport`]
const RECENT_ERRORS: usize = 10;

/// A failed item waiting to be retried
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// The item as it stood when it failed
    pub item: PendingItemRecord,
    /// Operation that failed (the download mode, e.g. `local_only`)
    pub operation: String,
    /// Error message of the last failure
    pub error: String,
    /// How many retries have already failed
    pub retry_count: u32,
    /// When the entry was (re)queued
    pub queued_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    /// New entry for a first failure
    pub fn new(
        item: PendingItemRecord,
        operation: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            item,
            operation: operation.into(),
            error: error.into(),
            retry_count: 0,
            queued_at: Utc::now(),
        }
    }

    /// The same entry after another failed attempt
    pub fn retried(mut self, error: impl Into<String>) -> Self {
        self.error = error.into();
        self.retry_count += 1;
        self.queued_at = Utc::now();
        self
    }
}

/// Bounded FIFO of failed items, optionally mirrored to a JSON file
#[derive(Debug)]
pub struct DeadLetterQueue {
    capacity: usize,
    path: Option<PathBuf>,
    entries: Mutex<VecDeque<DeadLetterEntry>>,
}

impl DeadLetterQueue {
    /// In-memory queue holding at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            path: None,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Queue persisted at `path`, loading whatever an earlier run left there
    ///
    /// A missing file starts an empty queue. An unreadable one is logged and
    /// replaced on the next write.
    pub async fn open(capacity: usize, path: PathBuf) -> Self {
        let mut queue = Self::new(capacity);
        let loaded = match tokio::fs::read(&path).await {
            Ok(raw) => match serde_json::from_slice::<VecDeque<DeadLetterEntry>>(&raw) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable dead-letter file");
                    VecDeque::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => VecDeque::new(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Could not read dead-letter file");
                VecDeque::new()
            }
        };
        let mut entries = loaded;
        while entries.len() > queue.capacity {
            entries.pop_front();
        }
        if !entries.is_empty() {
            tracing::info!(count = entries.len(), "Loaded dead-letter entries");
        }
        queue.entries = Mutex::new(entries);
        queue.path = Some(path);
        queue
    }

    /// Append an entry, evicting the oldest when full
    ///
    /// # Errors
    ///
    /// Writing the persistence file failed. The entry is queued regardless.
    pub async fn push(&self, entry: DeadLetterEntry) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if entries.len() >= self.capacity {
            if let Some(evicted) = entries.pop_front() {
                tracing::warn!(video_id = %evicted.item.video_id, "Dead-letter queue full, dropping oldest entry");
            }
        }
        tracing::debug!(
            video_id = %entry.item.video_id,
            operation = %entry.operation,
            retry_count = entry.retry_count,
            "Queued failed item"
        );
        entries.push_back(entry);
        self.persist(&entries).await
    }

    /// Remove and return every entry
    ///
    /// A failure to rewrite the persistence file is logged; the entries are
    /// returned regardless.
    pub async fn take_all(&self) -> Vec<DeadLetterEntry> {
        let mut entries = self.entries.lock().await;
        let taken: Vec<_> = entries.drain(..).collect();
        if let Err(e) = self.persist(&entries).await {
            tracing::warn!(error = %e, "Failed to persist drained dead-letter queue");
        }
        taken
    }

    /// Copy of every entry, oldest first
    pub async fn entries(&self) -> Vec<DeadLetterEntry> {
        self.entries.lock().await.iter().cloned().collect()
    }

    /// Number of queued entries
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether the queue is empty
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    async fn persist(&self, entries: &VecDeque<DeadLetterEntry>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let raw = serde_json::to_vec_pretty(entries)?;
        tokio::fs::write(path, raw).await?;
        Ok(())
    }
}

/// One dead-letter entry as shown in a [`RecoveryReport`]
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeadLetterSummary {
    /// Item identifier
    pub video_id: String,
    /// Owner identifier
    pub owner_id: String,
    /// Last error
    pub error: String,
    /// Failed retries so far
    pub retry_count: u32,
    /// When the entry was queued
    pub queued_at: DateTime<Utc>,
}

impl From<&DeadLetterEntry> for DeadLetterSummary {
    fn from(entry: &DeadLetterEntry) -> Self {
        Self {
            video_id: entry.item.video_id.clone(),
            owner_id: entry.item.owner_id.clone(),
            error: entry.error.clone(),
            retry_count: entry.retry_count,
            queued_at: entry.queued_at,
        }
    }
}

/// Snapshot of everything that went wrong and what can still be retried
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RecoveryReport {
    /// Circuit state per operation
    pub circuit_breakers: Vec<(String, CircuitState)>,
    /// Entries waiting in the dead-letter queue
    pub dead_letter_queue_size: usize,
    /// Dead-letter entries grouped by failed operation
    pub dead_letter_details: BTreeMap<String, Vec<DeadLetterSummary>>,
    /// Errors recorded in the progress log
    pub errors_count: usize,
    /// The most recent errors, oldest first
    pub recent_errors: Vec<String>,
}

impl RecoveryReport {
    /// Assemble a report from its parts
    pub fn build(
        circuit_breakers: Vec<(String, CircuitState)>,
        dead_letters: &[DeadLetterEntry],
        errors: &[String],
    ) -> Self {
        let mut details: BTreeMap<String, Vec<DeadLetterSummary>> = BTreeMap::new();
        for entry in dead_letters {
            details
                .entry(entry.operation.clone())
                .or_default()
                .push(entry.into());
        }
        let recent_start = errors.len().saturating_sub(RECENT_ERRORS);
        Self {
            circuit_breakers,
            dead_letter_queue_size: dead_letters.len(),
            dead_letter_details: details,
            errors_count: errors.len(),
            recent_errors: errors[recent_start..].to_vec(),
        }
    }
}
