//! Tests for the monitoring controller

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use super::*;
use crate::config::AppConfig;
use crate::core::types::{EventType, Label, NewEvent};
use crate::events::log::MemoryEventLog;
use crate::tag::sidecar::MemorySidecar;
use crate::tag::TagStore;
use crate::watcher::PathFilterConfig;

struct Fixture {
    controller: MonitoringController,
    recorder: Arc<AuditRecorder>,
    tagging: TaggingService,
    store: Arc<SqliteTagStore>,
    dir: TempDir,
    _db_dir: TempDir,
}

async fn fixture_with(log: MemoryEventLog, volumes: Option<Vec<PathBuf>>) -> Fixture {
    let dir = TempDir::new().unwrap();
    let db_dir = TempDir::new().unwrap();
    let store = Arc::new(
        SqliteTagStore::open(&DatabaseConfig::with_path(db_dir.path().join("dlp.db")).with_wal(false))
            .await
            .unwrap(),
    );
    let sidecar = Arc::new(MemorySidecar::default());
    let watch_set = Arc::new(WatchSet::new());
    let recorder = Arc::new(AuditRecorder::new(
        Arc::new(log),
        EventPublisher::new(64),
        RecorderConfig {
            max_retries: 0,
            retry_base: Duration::from_millis(1),
            warning_capacity: 10,
        },
    ));

    let config = ControllerConfig {
        volumes: volumes.unwrap_or_else(|| vec![dir.path().to_path_buf()]),
        filter: PathFilterConfig::default(),
        stop_timeout: Duration::from_secs(5),
        ..ControllerConfig::default()
    };
    let controller = MonitoringController::new(
        MonitoredFileResolver::new(store.clone(), sidecar.clone()),
        watch_set.clone(),
        recorder.clone(),
        config,
    );
    let tagging = TaggingService::new(store.clone(), sidecar, watch_set);

    Fixture {
        controller,
        recorder,
        tagging,
        store,
        dir,
        _db_dir: db_dir,
    }
}

async fn fixture() -> Fixture {
    fixture_with(MemoryEventLog::default(), None).await
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_start_and_stop_are_idempotent() {
    let fx = fixture().await;

    assert!(fx.controller.start().await.unwrap());
    assert!(!fx.controller.start().await.unwrap());
    assert!(fx.controller.is_active().await);

    assert!(fx.controller.stop().await);
    assert!(!fx.controller.stop().await);
    assert!(!fx.controller.is_active().await);
}

#[tokio::test]
async fn test_restart_after_stop() {
    let fx = fixture().await;

    assert!(fx.controller.start().await.unwrap());
    assert!(fx.controller.stop().await);
    assert!(fx.controller.start().await.unwrap());
    assert!(fx.controller.stop().await);
}

#[tokio::test]
async fn test_start_without_usable_volume_fails() {
    let missing = std::env::temp_dir().join("dlp-monitor-no-such-volume-7f3a");
    let fx = fixture_with(MemoryEventLog::default(), Some(vec![missing])).await;

    assert!(fx.controller.start().await.is_err());
    assert!(!fx.controller.is_active().await);
}

#[tokio::test]
async fn test_unusable_volume_does_not_block_others() {
    let good = TempDir::new().unwrap();
    let missing = good.path().join("absent");
    let fx = fixture_with(
        MemoryEventLog::default(),
        Some(vec![missing, good.path().to_path_buf()]),
    )
    .await;

    assert!(fx.controller.start().await.unwrap());
    let status = fx.controller.get_status().await;
    assert_eq!(status.watchers.len(), 1);
    assert_eq!(status.watchers[0].root, good.path().to_path_buf());
    fx.controller.stop().await;
}

// ============================================================================
// Status and queries
// ============================================================================

#[tokio::test]
async fn test_status_reports_seeded_watch_set() {
    let fx = fixture().await;
    let path = fx.dir.path().join("report.xlsx");
    std::fs::write(&path, b"numbers").unwrap();
    fx.tagging.tag_path(&path, &Label::Confidential).await.unwrap();
    fx.controller.watch_set().clear();

    let before = fx.controller.get_status().await;
    assert!(!before.active);
    assert_eq!(before.watched_files, 0);

    fx.controller.start().await.unwrap();
    let status = fx.controller.get_status().await;
    assert!(status.active);
    assert_eq!(status.watched_files, 1);
    assert_eq!(status.watchers.len(), 1);
    fx.controller.stop().await;
}

#[tokio::test]
async fn test_list_monitored_files() {
    let fx = fixture().await;
    let path = fx.dir.path().join("a.txt");
    std::fs::write(&path, b"alpha").unwrap();
    let outcome = fx.tagging.tag_path(&path, &Label::Secret).await.unwrap();

    let files = fx.controller.list_monitored_files().await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].sha256, outcome.content_hash);
    assert_eq!(files[0].label, Label::Secret);
    assert_eq!(files[0].path, Some(path));

    fx.store.set_monitored(&outcome.content_hash, false).await.unwrap();
    assert!(fx.controller.list_monitored_files().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_degraded_warnings_are_reported() {
    let fx = fixture_with(MemoryEventLog::failing(usize::MAX), None).await;
    let mut live = fx.controller.subscribe_events();

    fx.recorder
        .record(NewEvent::new(EventType::FileDeleted, "/data/x.txt"))
        .await;

    assert_eq!(fx.controller.degraded_warnings().len(), 1);
    assert_eq!(fx.controller.get_status().await.degraded_warnings, 1);
    assert_eq!(live.recv().await.unwrap().id, 0);
    assert!(fx.controller.list_recent_events(10).await.unwrap().is_empty());
}

#[test]
fn test_controller_config_excludes_data_dir() {
    let temp = TempDir::new().unwrap();
    let mut app = AppConfig::default();
    app.storage.data_dir = temp.path().to_path_buf();
    app.monitoring.classifier_workers = 2;

    let config = ControllerConfig::from_app(&app);
    let data_dir = std::fs::canonicalize(temp.path()).unwrap();
    assert_eq!(config.filter.excluded_roots, vec![data_dir]);
    assert_eq!(config.dispatcher.workers, 2);
    assert_eq!(config.watcher.rename_window, Duration::from_millis(500));
}

#[tokio::test]
async fn test_services_open_creates_both_stores() {
    let temp = TempDir::new().unwrap();
    let mut app = AppConfig::default();
    app.storage.data_dir = temp.path().join("data");
    app.monitoring.volumes = vec![temp.path().to_path_buf()];

    let services = DlpServices::open(&app).await.unwrap();

    assert!(temp.path().join("data/dlp.db").exists());
    assert!(temp.path().join("data/events.db").exists());
    assert!(services.controller.list_recent_events(5).await.unwrap().is_empty());
}

// ============================================================================
// End to end
// ============================================================================

#[tokio::test]
async fn test_copy_is_detected_end_to_end() {
    let fx = fixture().await;
    let original = fx.dir.path().join("report.xlsx");
    std::fs::write(&original, b"confidential quarterly figures").unwrap();
    fx.tagging.tag_path(&original, &Label::Confidential).await.unwrap();

    let mut live = fx.controller.subscribe_events();
    fx.controller.start().await.unwrap();
    // Give the subscription a moment to settle before generating activity
    tokio::time::sleep(Duration::from_millis(200)).await;

    let backup = fx.dir.path().join("backup");
    std::fs::create_dir_all(&backup).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    std::fs::copy(&original, backup.join("report.xlsx")).unwrap();

    let created = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = live.recv().await.unwrap();
            if event.event_type == EventType::FileCreated
                && event.file_path.ends_with("backup/report.xlsx")
            {
                return event;
            }
        }
    })
    .await
    .expect("copy was not reported");

    assert_eq!(created.label, Some(Label::Confidential));
    fx.controller.stop().await;
}
