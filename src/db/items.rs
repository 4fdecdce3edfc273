//! Processed-item ids, item records and channel owners.

use crate::error::DatabaseError;
use crate::types::{DownloadResult, PendingItemRecord, PersonRecord};
use crate::{Error, Result};

use super::{Database, VideoRecord};

impl Database {
    /// Record `video_id` as processed under `uuid`
    ///
    /// Re-marking replaces the stored UUID.
    pub async fn mark_processed(&self, video_id: &str, uuid: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO processed_items (video_id, uuid, processed_at)
            VALUES (?, ?, ?)
            ON CONFLICT(video_id) DO UPDATE SET
                uuid = excluded.uuid,
                processed_at = excluded.processed_at
            "#,
        )
        .bind(video_id)
        .bind(uuid)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to mark item as processed: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Every processed (video_id, uuid) pair
    pub async fn processed_items(&self) -> Result<Vec<(String, String)>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT video_id, uuid FROM processed_items ORDER BY processed_at")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::QueryFailed(format!(
                        "Failed to load processed items: {}",
                        e
                    )))
                })?;

        Ok(rows)
    }

    /// Insert `record`, or refresh the metadata of the record already stored
    /// for the same owner and item
    ///
    /// Returns the UUID the record is stored under. For an existing record this
    /// is the original UUID, and its download status, remote path, size and
    /// error are left as they were.
    pub async fn upsert_video_record(&self, record: &PendingItemRecord) -> Result<String> {
        let now = chrono::Utc::now().timestamp();
        let uuid: String = sqlx::query_scalar(
            r#"
            INSERT INTO video_records (
                uuid, video_id, owner_id, title, duration_secs, upload_date,
                view_count, url, download_status, remote_path, file_size,
                error_message, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(owner_id, video_id) DO UPDATE SET
                title = excluded.title,
                duration_secs = excluded.duration_secs,
                upload_date = excluded.upload_date,
                view_count = excluded.view_count,
                url = excluded.url,
                updated_at = excluded.updated_at
            RETURNING uuid
            "#,
        )
        .bind(&record.uuid)
        .bind(&record.video_id)
        .bind(&record.owner_id)
        .bind(&record.title)
        .bind(record.duration_secs.map(to_i64))
        .bind(record.upload_date.map(|d| d.format("%Y-%m-%d").to_string()))
        .bind(record.view_count.map(to_i64))
        .bind(&record.url)
        .bind(record.download_status.as_str())
        .bind(&record.remote_path)
        .bind(record.file_size.map(to_i64))
        .bind(&record.error_message)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to upsert video record: {}",
                e
            )))
        })?;

        Ok(uuid)
    }

    /// Store the outcome of a download attempt on its record
    ///
    /// Returns false when no record exists for the result's UUID.
    pub async fn update_video_status(&self, result: &DownloadResult) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();
        let outcome = sqlx::query(
            r#"
            UPDATE video_records
            SET download_status = ?, remote_path = ?, file_size = ?,
                error_message = ?, updated_at = ?
            WHERE uuid = ?
            "#,
        )
        .bind(result.status().as_str())
        .bind(result.remote_path())
        .bind(result.file_size().map(to_i64))
        .bind(result.error_message())
        .bind(now)
        .bind(result.video_uuid())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to update video status: {}",
                e
            )))
        })?;

        Ok(outcome.rows_affected() > 0)
    }

    /// Stored record for `uuid`
    pub async fn get_video_record(&self, uuid: &str) -> Result<Option<VideoRecord>> {
        let row = sqlx::query_as::<_, VideoRecord>(
            r#"
            SELECT
                uuid, video_id, owner_id, title, duration_secs, upload_date,
                view_count, url, download_status, remote_path, file_size,
                error_message, created_at, updated_at
            FROM video_records
            WHERE uuid = ?
            "#,
        )
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get video record: {}",
                e
            )))
        })?;

        Ok(row)
    }

    /// Records of `owner_id`, oldest first
    pub async fn list_video_records(&self, owner_id: &str) -> Result<Vec<VideoRecord>> {
        let rows = sqlx::query_as::<_, VideoRecord>(
            r#"
            SELECT
                uuid, video_id, owner_id, title, duration_secs, upload_date,
                view_count, url, download_status, remote_path, file_size,
                error_message, created_at, updated_at
            FROM video_records
            WHERE owner_id = ?
            ORDER BY created_at, video_id
            "#,
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list video records: {}",
                e
            )))
        })?;

        Ok(rows)
    }

    /// Insert or refresh a channel owner
    pub async fn upsert_owner(&self, person: &PersonRecord) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO owners (owner_id, name, email, kind, channel_url, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(owner_id) DO UPDATE SET
                name = excluded.name,
                email = excluded.email,
                kind = excluded.kind,
                channel_url = excluded.channel_url,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(person.owner_id())
        .bind(&person.name)
        .bind(&person.email)
        .bind(&person.kind)
        .bind(&person.channel_url)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to upsert owner: {}",
                e
            )))
        })?;

        Ok(())
    }
}

/// SQLite integers are signed; counts above i64::MAX are clamped
fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
