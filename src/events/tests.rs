//! Tests for the audit event pipeline

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use proptest::prelude::*;
use tempfile::TempDir;

use super::log::MemoryEventLog;
use super::recorder::retry_delay_with_jitter;
use super::*;
use crate::core::types::{ContentHash, EventType, Label, NewEvent};
use crate::db::DatabaseConfig;

async fn setup_test_log() -> (SqliteEventLog, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let config = DatabaseConfig::with_path(temp_dir.path().join("events.db")).with_wal(false);
    let log = SqliteEventLog::open(&config).await.unwrap();
    (log, temp_dir)
}

fn fast_config() -> RecorderConfig {
    RecorderConfig {
        max_retries: 3,
        retry_base: Duration::from_millis(1),
        warning_capacity: 100,
    }
}

fn sample_event(path: &str) -> NewEvent {
    NewEvent::new(EventType::FileModified, path)
        .with_label(Some(Label::Confidential))
        .with_hash(Some(ContentHash::from_hex("ab".repeat(32))))
        .with_actor("alice")
        .with_details("File content changed")
}

// ============================================================================
// SQLite log
// ============================================================================

#[tokio::test]
async fn test_append_assigns_increasing_ids() {
    let (log, _dir) = setup_test_log().await;

    let first = log.append(&sample_event("/data/a.txt")).await.unwrap();
    let second = log.append(&sample_event("/data/b.txt")).await.unwrap();

    assert!(second.id > first.id);
    assert_eq!(first.file_path, std::path::PathBuf::from("/data/a.txt"));
    assert_eq!(first.label, Some(Label::Confidential));
}

#[tokio::test]
async fn test_recent_is_newest_first_and_limited() {
    let (log, _dir) = setup_test_log().await;
    for i in 0..5 {
        log.append(&sample_event(&format!("/data/{}.txt", i)))
            .await
            .unwrap();
    }

    let recent = log.recent(3).await.unwrap();
    assert_eq!(recent.len(), 3);
    assert_eq!(recent[0].file_path, std::path::PathBuf::from("/data/4.txt"));
    assert!(recent[0].id > recent[1].id && recent[1].id > recent[2].id);
}

#[tokio::test]
async fn test_rename_round_trips_through_storage() {
    let (log, _dir) = setup_test_log().await;
    let event = NewEvent::new(EventType::FileRenamed, "/data/old.txt")
        .with_new_path("/data/new.txt")
        .with_label(Some(Label::Secret));
    let logged = log.append(&event).await.unwrap();

    let recent = log.recent(1).await.unwrap();
    assert_eq!(recent[0], logged);
    assert_eq!(
        recent[0].new_path,
        Some(std::path::PathBuf::from("/data/new.txt"))
    );
}

#[tokio::test]
async fn test_rows_from_older_writers_are_read() {
    let (log, _dir) = setup_test_log().await;
    sqlx::query(
        "INSERT INTO events (timestamp, event_type, file_path, label, user) VALUES (?, ?, ?, ?, ?)",
    )
    .bind("2024-05-01T10:20:30.123456")
    .bind("SOMETHING_NEW")
    .bind("C:\\legacy.docx")
    .bind("")
    .bind("CORP\\bob")
    .execute(log.pool())
    .await
    .unwrap();

    let recent = log.recent(10).await.unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].event_type, EventType::Unknown);
    assert_eq!(recent[0].label, None);
    assert_eq!(recent[0].timestamp.timestamp(), 1714558830);
    assert_eq!(recent[0].actor_identity, "CORP\\bob");
}

#[tokio::test]
async fn test_concurrent_appends_get_unique_ids() {
    let (log, _dir) = setup_test_log().await;
    let log = Arc::new(log);

    let mut handles = Vec::new();
    for i in 0..20 {
        let log = log.clone();
        handles.push(tokio::spawn(async move {
            log.append(&sample_event(&format!("/data/{}.txt", i)))
                .await
                .unwrap()
                .id
        }));
    }
    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap());
    }
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 20);
}

// ============================================================================
// Publisher
// ============================================================================

#[tokio::test]
async fn test_publish_reaches_every_subscriber() {
    let publisher = EventPublisher::new(16);
    let mut a = publisher.subscribe();
    let mut b = publisher.subscribe();

    let delivered = publisher.publish(sample_event("/x").into_event(1));
    assert_eq!(delivered, 2);
    assert_eq!(a.recv().await.unwrap().id, 1);
    assert_eq!(b.recv().await.unwrap().id, 1);
}

#[tokio::test]
async fn test_publish_without_subscribers_is_fine() {
    let publisher = EventPublisher::default();
    assert_eq!(publisher.publish(sample_event("/x").into_event(1)), 0);
}

#[tokio::test]
async fn test_lagging_subscriber_skips_to_retained_events() {
    let publisher = EventPublisher::new(2);
    let mut sub = publisher.subscribe();
    for id in 1..=5 {
        publisher.publish(sample_event("/x").into_event(id));
    }

    let first = sub.recv().await.unwrap();
    assert_eq!(first.id, 4);
    assert_eq!(sub.try_recv().unwrap().id, 5);
    assert!(sub.try_recv().is_none());
}

#[tokio::test]
async fn test_subscription_stream_ends_with_publisher() {
    let publisher = EventPublisher::new(8);
    let stream = publisher.subscribe().into_stream();
    publisher.publish(sample_event("/x").into_event(7));
    drop(publisher);

    let collected: Vec<_> = stream.collect().await;
    assert_eq!(collected.len(), 1);
    assert_eq!(collected[0].id, 7);
}

// ============================================================================
// Recorder
// ============================================================================

#[tokio::test]
async fn test_record_persists_then_publishes() {
    let log = Arc::new(MemoryEventLog::default());
    let recorder = AuditRecorder::new(log.clone(), EventPublisher::new(8), fast_config());
    let mut sub = recorder.subscribe();

    let recorded = recorder.record(sample_event("/data/a.txt")).await;

    assert!(recorded.is_logged());
    assert_eq!(log.events().len(), 1);
    let live = sub.recv().await.unwrap();
    assert_eq!(live.id, 1);
    assert_eq!(recorder.degraded_count(), 0);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let log = Arc::new(MemoryEventLog::failing(2));
    let recorder = AuditRecorder::new(log.clone(), EventPublisher::new(8), fast_config());

    let recorded = recorder.record(sample_event("/data/a.txt")).await;

    assert!(recorded.is_logged());
    assert_eq!(log.attempts(), 3);
    assert_eq!(log.events().len(), 1);
}

#[tokio::test]
async fn test_exhausted_retries_degrade_but_still_publish() {
    let log = Arc::new(MemoryEventLog::failing(usize::MAX));
    let recorder = AuditRecorder::new(log.clone(), EventPublisher::new(8), fast_config());
    let mut sub = recorder.subscribe();

    let recorded = recorder.record(sample_event("/data/a.txt")).await;

    match recorded {
        Recorded::Degraded(warning) => {
            assert_eq!(warning.event.file_path, std::path::PathBuf::from("/data/a.txt"));
            assert!(warning.reason.contains("4 attempts"));
        }
        Recorded::Logged(_) => panic!("expected degraded outcome"),
    }
    assert_eq!(log.attempts(), 4);
    assert!(log.events().is_empty());

    let live = sub.recv().await.unwrap();
    assert_eq!(live.id, 0);
    assert_eq!(recorder.degraded_warnings().len(), 1);
}

#[tokio::test]
async fn test_warning_ring_is_bounded() {
    let log = Arc::new(MemoryEventLog::failing(usize::MAX));
    let config = RecorderConfig {
        max_retries: 0,
        retry_base: Duration::from_millis(1),
        warning_capacity: 3,
    };
    let recorder = AuditRecorder::new(log, EventPublisher::new(8), config);

    for i in 0..5 {
        recorder.record(sample_event(&format!("/data/{}.txt", i))).await;
    }

    let warnings = recorder.degraded_warnings();
    assert_eq!(warnings.len(), 3);
    assert_eq!(warnings[0].event.file_path, std::path::PathBuf::from("/data/2.txt"));
    assert_eq!(warnings[2].event.file_path, std::path::PathBuf::from("/data/4.txt"));
}

// ============================================================================
// Retry delay
// ============================================================================

#[test]
fn test_retry_delay_doubles() {
    let base = Duration::from_millis(100);
    assert_eq!(retry_delay_with_jitter(base, 0, 0.5), Duration::from_millis(100));
    assert_eq!(retry_delay_with_jitter(base, 1, 0.5), Duration::from_millis(200));
    assert_eq!(retry_delay_with_jitter(base, 2, 0.5), Duration::from_millis(400));
}

proptest! {
    #[test]
    fn prop_retry_delay_within_jitter_bounds(attempt in 0u32..10, r in 0.0f64..=1.0) {
        let base = Duration::from_millis(100);
        let delay = retry_delay_with_jitter(base, attempt, r);
        let nominal = base.as_secs_f64() * f64::from(1u32 << attempt.min(6));
        let secs = delay.as_secs_f64();
        prop_assert!(secs >= nominal * 0.75 - 1e-9);
        prop_assert!(secs <= nominal * 1.25 + 1e-9);
    }
}
