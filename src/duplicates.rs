//! Duplicate tracking for already-processed items
//!
//! The tracker is the run-wide record of which item identifiers have been
//! processed and which UUID each was stored under. Reads fail safe (anything
//! that is not a usable identifier counts as a duplicate so it is never
//! scheduled), writes fail fast (bad input is rejected and changes nothing).
//!
//! Identifiers can also be reserved while a channel works on them. A reserved
//! identifier cannot be claimed again until it is marked processed (which
//! consumes the reservation) or released. Two channels listing the same item
//! therefore never transfer it at the same time.
//!
//! All access goes through one mutex; every critical section is O(1) except
//! [`DuplicateTracker::stats`], [`DuplicateTracker::load_existing`] and
//! [`DuplicateTracker::release_all`].

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// Snapshot of the tracker contents
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DuplicateStats {
    /// Number of tracked identifiers
    pub count: usize,
    /// Tracked identifiers, sorted
    pub ids: Vec<String>,
}

#[derive(Debug, Default)]
struct TrackerState {
    processed: HashMap<String, Option<String>>,
    reserved: HashSet<String>,
}

/// Thread-safe set of processed item identifiers with their UUIDs
#[derive(Debug, Default)]
pub struct DuplicateTracker {
    state: Mutex<TrackerState>,
}

impl DuplicateTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `video_id` was already processed
    ///
    /// Empty or whitespace-only identifiers are reported as duplicates.
    /// Reserved identifiers are not; see [`try_reserve`](Self::try_reserve).
    pub async fn is_duplicate(&self, video_id: &str) -> bool {
        let id = video_id.trim();
        if id.is_empty() {
            tracing::warn!("Empty item identifier treated as duplicate");
            return true;
        }
        self.state.lock().await.processed.contains_key(id)
    }

    /// [`is_duplicate`](Self::is_duplicate) for loosely typed identifiers
    ///
    /// `null` and any non-string value are reported as duplicates.
    pub async fn is_duplicate_value(&self, value: &serde_json::Value) -> bool {
        match value.as_str() {
            Some(id) => self.is_duplicate(id).await,
            None => {
                tracing::warn!(value = %value, "Non-string item identifier treated as duplicate");
                true
            }
        }
    }

    /// Claim `video_id` for processing
    ///
    /// Returns false, claiming nothing, when the identifier is empty, already
    /// processed or already reserved.
    pub async fn try_reserve(&self, video_id: &str) -> bool {
        let id = video_id.trim();
        if id.is_empty() {
            return false;
        }
        let mut state = self.state.lock().await;
        if state.processed.contains_key(id) {
            return false;
        }
        state.reserved.insert(id.to_string())
    }

    /// Whether `video_id` is currently reserved
    pub async fn is_reserved(&self, video_id: &str) -> bool {
        self.state.lock().await.reserved.contains(video_id.trim())
    }

    /// Drop the reservations on `ids`; unreserved identifiers are ignored
    pub async fn release_all<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut state = self.state.lock().await;
        for id in ids {
            state.reserved.remove(id.as_ref().trim());
        }
    }

    /// Record `video_id` as processed under `uuid`, consuming any reservation
    ///
    /// Re-marking an identifier is idempotent and replaces its UUID.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if either argument is empty; the tracker is
    /// left untouched.
    pub async fn mark_processed(&self, video_id: &str, uuid: &str) -> Result<()> {
        let id = video_id.trim();
        if id.is_empty() {
            return Err(Error::validation("cannot mark an empty video_id as processed"));
        }
        let uuid = uuid.trim();
        if uuid.is_empty() {
            return Err(Error::validation(format!(
                "cannot mark video {id} as processed without a UUID"
            )));
        }

        let mut state = self.state.lock().await;
        state.reserved.remove(id);
        state
            .processed
            .insert(id.to_string(), Some(uuid.to_string()));
        tracing::debug!(video_id = id, uuid, "Marked item as processed");
        Ok(())
    }

    /// UUID recorded for `video_id`, if any
    pub async fn get_uuid(&self, video_id: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .processed
            .get(video_id.trim())
            .cloned()
            .flatten()
    }

    /// Seed the tracker with identifiers processed by earlier runs
    ///
    /// Identifiers loaded this way have no UUID until they are re-marked.
    /// Empty identifiers are ignored. Returns the number of new identifiers.
    pub async fn load_existing<I, S>(&self, ids: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut state = self.state.lock().await;
        let mut added = 0;
        for id in ids {
            let id = id.as_ref().trim();
            if id.is_empty() {
                continue;
            }
            if !state.processed.contains_key(id) {
                state.processed.insert(id.to_string(), None);
                added += 1;
            }
        }
        tracing::info!(added, total = state.processed.len(), "Loaded existing processed items");
        added
    }

    /// Seed the tracker with (identifier, UUID) pairs from persistence
    pub async fn load_existing_with_uuids<I>(&self, pairs: I) -> usize
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut state = self.state.lock().await;
        let mut added = 0;
        for (id, uuid) in pairs {
            let id = id.trim();
            if id.is_empty() {
                continue;
            }
            let uuid = Some(uuid.trim().to_string()).filter(|u| !u.is_empty());
            if state.processed.insert(id.to_string(), uuid).is_none() {
                added += 1;
            }
        }
        added
    }

    /// [`load_existing`](Self::load_existing) for a JSON value
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if `value` is not an array, or if any element
    /// is not a string. Nothing is loaded on error.
    pub async fn load_existing_value(&self, value: &serde_json::Value) -> Result<usize> {
        let items = value.as_array().ok_or_else(|| {
            Error::validation(format!(
                "existing ids must be a list, got {}",
                json_kind(value)
            ))
        })?;
        let ids = items
            .iter()
            .map(|item| {
                item.as_str().ok_or_else(|| {
                    Error::validation(format!(
                        "existing ids must be strings, got {}",
                        json_kind(item)
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(self.load_existing(ids).await)
    }

    /// Forget every tracked identifier and reservation
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        let cleared = state.processed.len();
        state.processed.clear();
        state.reserved.clear();
        tracing::info!(cleared, "Duplicate tracker reset");
    }

    /// Count and sorted identifiers of processed items
    pub async fn stats(&self) -> DuplicateStats {
        let state = self.state.lock().await;
        let mut ids: Vec<String> = state.processed.keys().cloned().collect();
        ids.sort();
        DuplicateStats {
            count: ids.len(),
            ids,
        }
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
