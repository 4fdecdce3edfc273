use crate::db::*;
use crate::types::{DownloadResult, DownloadStatus, PendingItemRecord, PersonRecord, VideoMetadata};
use chrono::NaiveDate;
use tempfile::NamedTempFile;

const UUID_A: &str = "550e8400-e29b-41d4-a716-446655440000";
const UUID_B: &str = "6ba7b810-9dad-11d1-80b4-00c04fd430c8";

fn record(video_id: &str, uuid: &str) -> PendingItemRecord {
    let video = VideoMetadata {
        video_id: video_id.to_string(),
        title: format!("Video {video_id}"),
        duration_secs: Some(300),
        upload_date: NaiveDate::from_ymd_opt(2023, 11, 2),
        view_count: Some(1_000),
        description: Some("desc".to_string()),
        channel_id: "UC1".to_string(),
        uploader: None,
        url: format!("https://example.com/watch?v={video_id}"),
    };
    PendingItemRecord::new("owner@example.com", &video, Some(uuid)).unwrap()
}

#[tokio::test]
async fn test_mark_processed_and_load() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();

    db.mark_processed("a", UUID_A).await.unwrap();
    db.mark_processed("b", UUID_B).await.unwrap();
    // Re-marking replaces the UUID instead of duplicating the row
    db.mark_processed("a", UUID_B).await.unwrap();

    let mut items = db.processed_items().await.unwrap();
    items.sort();
    assert_eq!(
        items,
        vec![
            ("a".to_string(), UUID_B.to_string()),
            ("b".to_string(), UUID_B.to_string())
        ]
    );

    db.close().await;
}

#[tokio::test]
async fn test_upsert_and_get_video_record() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();

    let item = record("abc", UUID_A);
    db.upsert_video_record(&item).await.unwrap();

    let stored = db.get_video_record(UUID_A).await.unwrap().unwrap();
    assert_eq!(stored.video_id, "abc");
    assert_eq!(stored.owner_id, "owner@example.com");
    assert_eq!(stored.duration_secs, Some(300));
    assert_eq!(stored.upload_date.as_deref(), Some("2023-11-02"));
    assert_eq!(stored.download_status, "pending");
    assert!(stored.remote_path.is_none());

    // Second upsert updates in place
    let mut item = item;
    item.title = "Renamed".to_string();
    db.upsert_video_record(&item).await.unwrap();
    let stored = db.get_video_record(UUID_A).await.unwrap().unwrap();
    assert_eq!(stored.title, "Renamed");
    assert_eq!(db.list_video_records("owner@example.com").await.unwrap().len(), 1);

    assert!(db.get_video_record(UUID_B).await.unwrap().is_none());
    db.close().await;
}

#[tokio::test]
async fn test_upsert_keeps_one_record_per_owner_and_item() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();

    let first = record("abc", UUID_A);
    assert_eq!(db.upsert_video_record(&first).await.unwrap(), UUID_A);
    db.update_video_status(&DownloadResult::failed(&first, "HTTP Error 503"))
        .await
        .unwrap();

    // A later run builds the same item under a fresh UUID
    let mut again = record("abc", UUID_B);
    again.title = "Renamed".to_string();
    assert_eq!(db.upsert_video_record(&again).await.unwrap(), UUID_A);

    let rows = db.list_video_records("owner@example.com").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].uuid, UUID_A);
    assert_eq!(rows[0].title, "Renamed");
    assert_eq!(rows[0].download_status, "failed");
    assert_eq!(rows[0].error_message.as_deref(), Some("HTTP Error 503"));
    assert!(db.get_video_record(UUID_B).await.unwrap().is_none());

    db.close().await;
}

#[tokio::test]
async fn test_update_video_status_from_result() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();

    let item = record("abc", UUID_A);
    db.upsert_video_record(&item).await.unwrap();

    let result = DownloadResult::completed(&item)
        .with_remote_path(Some("s3://archive/mass-download/abc.mp4".to_string()))
        .with_file_size(Some(2048));
    assert!(db.update_video_status(&result).await.unwrap());

    let stored = db.get_video_record(UUID_A).await.unwrap().unwrap();
    assert_eq!(stored.download_status, DownloadStatus::Completed.as_str());
    assert_eq!(
        stored.remote_path.as_deref(),
        Some("s3://archive/mass-download/abc.mp4")
    );
    assert_eq!(stored.file_size, Some(2048));

    let failed = DownloadResult::failed(&item, "HTTP Error 403");
    db.update_video_status(&failed).await.unwrap();
    let stored = db.get_video_record(UUID_A).await.unwrap().unwrap();
    assert_eq!(stored.download_status, "failed");
    assert_eq!(stored.error_message.as_deref(), Some("HTTP Error 403"));

    // Unknown UUID touches nothing
    let other = DownloadResult::completed(&record("zzz", UUID_B));
    assert!(!db.update_video_status(&other).await.unwrap());

    db.close().await;
}

#[tokio::test]
async fn test_upsert_owner() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();

    let person = PersonRecord::new("Jane", "Jane@Example.com", "creator", "https://example.com/@jane");
    db.upsert_owner(&person).await.unwrap();
    db.upsert_owner(&person).await.unwrap();

    let (count, name): (i64, String) =
        sqlx::query_as("SELECT COUNT(*), MAX(name) FROM owners WHERE owner_id = ?")
            .bind("jane@example.com")
            .fetch_one(db.pool())
            .await
            .unwrap();
    assert_eq!(count, 1);
    assert_eq!(name, "Jane");

    db.close().await;
}
