//! Database layer for mass-dl
//!
//! Optional SQLite persistence that makes repeated runs safe: processed item
//! ids survive restarts and feed the duplicate tracker, and every item record
//! is kept with its latest download outcome.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - [`migrations`]: database lifecycle, schema migrations
//! - [`items`]: processed-item ids, item records, channel owners

use sqlx::{FromRow, sqlite::SqlitePool};

mod items;
mod migrations;

/// Item record as stored in the database
#[derive(Debug, Clone, FromRow)]
pub struct VideoRecord {
    /// Item UUID (primary key)
    pub uuid: String,
    /// Item identifier
    pub video_id: String,
    /// Owner identifier
    pub owner_id: String,
    /// Title
    pub title: String,
    /// Duration in seconds
    pub duration_secs: Option<i64>,
    /// Publish date as `YYYY-MM-DD`
    pub upload_date: Option<String>,
    /// View count
    pub view_count: Option<i64>,
    /// Source URL
    pub url: String,
    /// Download status (pending, downloading, completed, failed)
    pub download_status: String,
    /// Remote path once uploaded
    pub remote_path: Option<String>,
    /// Size in bytes
    pub file_size: Option<i64>,
    /// Last download error
    pub error_message: Option<String>,
    /// Unix timestamp when the record was first stored
    pub created_at: i64,
    /// Unix timestamp of the last change
    pub updated_at: i64,
}

/// Database handle for mass-dl
pub struct Database {
    pool: SqlitePool,
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
