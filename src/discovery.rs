//! Duplicate-aware channel discovery
//!
//! Thin layer over a [`ChannelEnumerator`]. Calls are never retried here; the
//! coordinator decides what a failure means for the channel.

use std::sync::Arc;

use url::Url;

use crate::clients::ChannelEnumerator;
use crate::duplicates::DuplicateTracker;
use crate::error::{Error, Result};
use crate::types::{ChannelInfo, VideoMetadata};

/// Enumerates channels and separates new items from already-processed ones
#[derive(Clone)]
pub struct ChannelDiscovery {
    enumerator: Arc<dyn ChannelEnumerator>,
    tracker: Arc<DuplicateTracker>,
}

impl ChannelDiscovery {
    /// Create a discovery facade sharing `tracker` with the rest of the run
    pub fn new(enumerator: Arc<dyn ChannelEnumerator>, tracker: Arc<DuplicateTracker>) -> Self {
        Self {
            enumerator,
            tracker,
        }
    }

    /// Resolve channel metadata
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] for a URL that is not http(s), [`Error::NotFound`]
    /// when the enumerator has no channel at the URL, or whatever the enumerator
    /// returned.
    pub async fn extract_channel_info(&self, channel_url: &str) -> Result<ChannelInfo> {
        validate_channel_url(channel_url)?;
        self.enumerator
            .extract_channel_info(channel_url)
            .await?
            .ok_or_else(|| Error::NotFound(format!("no channel at {channel_url}")))
    }

    /// List up to `max_items` items of the channel
    pub async fn enumerate_items(
        &self,
        channel_url: &str,
        max_items: Option<usize>,
    ) -> Result<Vec<VideoMetadata>> {
        validate_channel_url(channel_url)?;
        let mut items = self.enumerator.enumerate_items(channel_url, max_items).await?;
        if let Some(max) = max_items {
            items.truncate(max);
        }
        tracing::debug!(channel_url, count = items.len(), "Enumerated channel items");
        Ok(items)
    }

    /// Split `items` into those claimed for this caller and a count of the rest
    ///
    /// Every returned item is reserved in the duplicate tracker; the caller
    /// must mark it processed or release it. Items already processed, reserved
    /// by another caller, or repeated within `items` are counted as skipped.
    /// Input order is preserved.
    pub async fn filter_new(&self, items: Vec<VideoMetadata>) -> (Vec<VideoMetadata>, usize) {
        let mut fresh = Vec::with_capacity(items.len());
        let mut skipped = 0;
        for item in items {
            if self.tracker.try_reserve(&item.video_id).await {
                fresh.push(item);
            } else {
                tracing::debug!(video_id = %item.video_id, "Skipping duplicate item");
                skipped += 1;
            }
        }
        (fresh, skipped)
    }
}

/// Accept only absolute http(s) URLs with a host
pub fn validate_channel_url(channel_url: &str) -> Result<Url> {
    let parsed = Url::parse(channel_url.trim())
        .map_err(|e| Error::validation(format!("invalid channel URL '{channel_url}': {e}")))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some_and(|h| !h.is_empty()) => Ok(parsed),
        "http" | "https" => Err(Error::validation(format!(
            "channel URL '{channel_url}' has no host"
        ))),
        scheme => Err(Error::validation(format!(
            "channel URL '{channel_url}' must use http or https, not {scheme}"
        ))),
    }
}
