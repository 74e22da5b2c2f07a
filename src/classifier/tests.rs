//! Tests for classification, propagation and the dispatch pool

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use super::*;
use crate::core::types::{Event, EventType, Label};
use crate::core::utils::hash_bytes;
use crate::db::DatabaseConfig;
use crate::events::log::MemoryEventLog;
use crate::events::{AuditRecorder, EventPublisher, RecorderConfig};
use crate::tag::sidecar::MemorySidecar;
use crate::tag::{SidecarAccessor, SqliteTagStore, TaggingService};
use crate::watcher::{RawChange, RecordSink};

const REPORT: &[u8] = b"quarterly numbers, do not share";

struct Fixture {
    classifier: Arc<EventClassifier>,
    tagging: TaggingService,
    sidecar: Arc<MemorySidecar>,
    watch_set: Arc<WatchSet>,
    log: Arc<MemoryEventLog>,
    dir: TempDir,
    _db_dir: TempDir,
}

impl Fixture {
    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn write(&self, name: &str, content: &[u8]) -> PathBuf {
        let path = self.path(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        path
    }

    async fn tag(&self, name: &str, content: &[u8], label: Label) -> PathBuf {
        let path = self.write(name, content);
        self.tagging.tag_path(&path, &label).await.unwrap();
        path
    }

    async fn change(&self, action: RawAction, path: &Path) -> Classified {
        self.classifier
            .handle(WatchRecord::Change(RawChange::new(action, path)))
            .await
    }

    async fn rename(&self, from: &Path, to: &Path) -> Classified {
        self.classifier
            .handle(WatchRecord::Rename {
                from: RawChange::new(RawAction::RenamedOld, from),
                to: RawChange::new(RawAction::RenamedNew, to),
            })
            .await
    }

    fn events(&self) -> Vec<Event> {
        self.log.events()
    }
}

async fn fixture_with_log(log: MemoryEventLog) -> Fixture {
    let db_dir = TempDir::new().unwrap();
    let config = DatabaseConfig::with_path(db_dir.path().join("dlp.db")).with_wal(false);
    let store = Arc::new(SqliteTagStore::open(&config).await.unwrap());
    let sidecar = Arc::new(MemorySidecar::default());
    let watch_set = Arc::new(WatchSet::new());
    let log = Arc::new(log);

    let recorder = Arc::new(AuditRecorder::new(
        log.clone(),
        EventPublisher::new(64),
        RecorderConfig {
            max_retries: 1,
            retry_base: Duration::from_millis(1),
            warning_capacity: 10,
        },
    ));
    let resolver = MonitoredFileResolver::new(store.clone(), sidecar.clone());
    let classifier = Arc::new(EventClassifier::new(
        resolver,
        watch_set.clone(),
        recorder,
        ClassifierConfig {
            settle_window: Duration::from_secs(2),
            actor: "tester".to_string(),
        },
    ));
    let tagging = TaggingService::new(store, sidecar.clone(), watch_set.clone());

    Fixture {
        classifier,
        tagging,
        sidecar,
        watch_set,
        log,
        dir: TempDir::new().unwrap(),
        _db_dir: db_dir,
    }
}

async fn fixture() -> Fixture {
    fixture_with_log(MemoryEventLog::default()).await
}

// ============================================================================
// Propagation
// ============================================================================

#[tokio::test]
async fn test_copy_of_tagged_file_is_retagged_and_logged() {
    let fx = fixture().await;
    let original = fx.tag("report.xlsx", REPORT, Label::Confidential).await;
    let copy = fx.path("backup/report.xlsx");
    std::fs::create_dir_all(copy.parent().unwrap()).unwrap();
    std::fs::copy(&original, &copy).unwrap();
    assert!(fx.sidecar.read(&copy).is_none());

    let classified = fx.change(RawAction::Created, &copy).await;

    assert_eq!(classified.logged, 1);
    let events = fx.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::FileCreated);
    assert_eq!(events[0].file_path, copy);
    assert_eq!(events[0].label, Some(Label::Confidential));
    assert_eq!(events[0].content_hash, Some(hash_bytes(REPORT)));
    assert_eq!(events[0].actor_identity, "tester");
    assert_eq!(events[0].details.as_deref(), Some("File created/copied"));
    assert_eq!(fx.sidecar.read(&copy), Some(Label::Confidential));
    assert!(fx.watch_set.contains(&copy));
}

#[tokio::test]
async fn test_copy_echoes_do_not_add_events() {
    let fx = fixture().await;
    let original = fx.tag("report.xlsx", REPORT, Label::Confidential).await;
    let copy = fx.path("copy.xlsx");
    std::fs::copy(&original, &copy).unwrap();

    fx.change(RawAction::Created, &copy).await;
    // Our own sidecar write, then the writer closing the file
    fx.change(RawAction::AttributeChanged, &copy).await;
    fx.change(RawAction::WriteClosed, &copy).await;
    fx.change(RawAction::Modified, &copy).await;

    assert_eq!(fx.events().len(), 1);
}

#[tokio::test]
async fn test_copy_with_sidecar_intact_is_not_rewritten() {
    let fx = fixture().await;
    let original = fx.tag("a.txt", REPORT, Label::Secret).await;
    let copy = fx.path("b.txt");
    std::fs::copy(&original, &copy).unwrap();
    fx.sidecar.write(&copy, &Label::Secret).unwrap();
    let writes_before = fx.sidecar.write_count();

    fx.change(RawAction::Created, &copy).await;

    assert_eq!(fx.sidecar.write_count(), writes_before);
    assert_eq!(fx.events().len(), 1);
}

#[tokio::test]
async fn test_partial_copy_completes_on_write_close() {
    let fx = fixture().await;
    fx.tag("report.xlsx", REPORT, Label::Confidential).await;
    let copy = fx.write("incoming.xlsx", b"");

    assert_eq!(fx.change(RawAction::Created, &copy).await.total(), 0);
    std::fs::write(&copy, REPORT).unwrap();
    fx.change(RawAction::WriteClosed, &copy).await;

    let events = fx.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::FileCreated);
    assert_eq!(fx.sidecar.read(&copy), Some(Label::Confidential));
}

#[tokio::test]
async fn test_directory_copy_is_scanned() {
    let fx = fixture().await;
    fx.tag("report.xlsx", REPORT, Label::Internal).await;
    fx.write("archive/nested/report.xlsx", REPORT);
    fx.write("archive/readme.txt", b"nothing to see");

    fx.change(RawAction::Created, &fx.path("archive")).await;

    let events = fx.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].file_path, fx.path("archive/nested/report.xlsx"));
    assert_eq!(events[0].label, Some(Label::Internal));
}

// ============================================================================
// Modification
// ============================================================================

#[tokio::test]
async fn test_edit_of_tagged_file_is_logged_once() {
    let fx = fixture().await;
    let path = fx.tag("plan.docx", REPORT, Label::Restricted).await;
    std::fs::write(&path, b"revised plan").unwrap();

    fx.change(RawAction::Modified, &path).await;
    fx.change(RawAction::WriteClosed, &path).await;

    let events = fx.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::FileModified);
    // Sidecar still says restricted although the index no longer knows the content
    assert_eq!(events[0].label, Some(Label::Restricted));
    assert_eq!(events[0].content_hash, Some(hash_bytes(b"revised plan")));
}

#[tokio::test]
async fn test_foreign_attribute_change_is_logged() {
    let fx = fixture().await;
    let path = fx.tag("plan.docx", REPORT, Label::Restricted).await;
    // Forget the echo of the tagging write
    fx.watch_set.remove(&path);
    fx.watch_set.insert(&path, Label::Restricted, Some(hash_bytes(REPORT)));

    fx.change(RawAction::AttributeChanged, &path).await;

    let events = fx.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].details.as_deref(), Some("File attributes changed"));
}

#[tokio::test]
async fn test_unmonitored_churn_is_silent() {
    let fx = fixture().await;
    fx.tag("tagged.txt", REPORT, Label::Secret).await;
    let plain = fx.write("notes.txt", b"shopping list");
    let moved = fx.path("notes-old.txt");

    fx.change(RawAction::Created, &plain).await;
    fx.change(RawAction::Modified, &plain).await;
    fx.change(RawAction::AttributeChanged, &plain).await;
    fx.change(RawAction::Unknown, &plain).await;
    std::fs::rename(&plain, &moved).unwrap();
    fx.rename(&plain, &moved).await;
    std::fs::remove_file(&moved).unwrap();
    fx.change(RawAction::Deleted, &moved).await;

    assert!(fx.events().is_empty());
}

// ============================================================================
// Deletion and rename
// ============================================================================

#[tokio::test]
async fn test_delete_uses_cached_knowledge() {
    let fx = fixture().await;
    let path = fx.tag("gone.txt", REPORT, Label::Secret).await;
    std::fs::remove_file(&path).unwrap();

    fx.change(RawAction::Deleted, &path).await;

    let events = fx.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::FileDeleted);
    assert_eq!(events[0].label, Some(Label::Secret));
    assert_eq!(events[0].content_hash, Some(hash_bytes(REPORT)));
    assert!(!fx.watch_set.contains(&path));
}

#[tokio::test]
async fn test_deleted_directory_reports_watched_children() {
    let fx = fixture().await;
    fx.tag("dir/a.txt", b"alpha", Label::Secret).await;
    fx.tag("dir/b.txt", b"bravo", Label::Secret).await;
    std::fs::remove_dir_all(fx.path("dir")).unwrap();

    fx.change(RawAction::Deleted, &fx.path("dir")).await;

    let events = fx.events();
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.event_type == EventType::FileDeleted));
    assert!(fx.watch_set.is_empty());
}

#[tokio::test]
async fn test_rename_is_one_event_with_both_paths() {
    let fx = fixture().await;
    let a = fx.tag("a.txt", REPORT, Label::Confidential).await;
    let b = fx.path("b.txt");
    std::fs::rename(&a, &b).unwrap();

    fx.rename(&a, &b).await;

    let events = fx.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::FileRenamed);
    assert_eq!(events[0].file_path, a);
    assert_eq!(events[0].new_path, Some(b.clone()));
    assert_eq!(events[0].label, Some(Label::Confidential));
    assert!(fx.watch_set.contains(&b));
    assert!(!fx.watch_set.contains(&a));
}

#[tokio::test]
async fn test_directory_rename_moves_children() {
    let fx = fixture().await;
    fx.tag("projects/x.txt", b"x-ray", Label::Internal).await;
    fx.tag("projects/y.txt", b"yankee", Label::Internal).await;
    let from = fx.path("projects");
    let to = fx.path("archive");
    std::fs::rename(&from, &to).unwrap();

    fx.rename(&from, &to).await;

    let mut events = fx.events();
    events.sort_by(|a, b| a.file_path.cmp(&b.file_path));
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].file_path, from.join("x.txt"));
    assert_eq!(events[0].new_path, Some(to.join("x.txt")));
    assert!(fx.watch_set.contains(&to.join("y.txt")));
}

#[tokio::test]
async fn test_orphan_halves_are_single_sided() {
    let fx = fixture().await;
    let away = fx.tag("leaving.txt", b"leaving", Label::Secret).await;
    fx.tag("source.txt", REPORT, Label::Confidential).await;
    let arrived = fx.write("arrived.txt", REPORT);

    fx.change(RawAction::RenamedOld, &away).await;
    fx.change(RawAction::RenamedNew, &arrived).await;

    let events = fx.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].event_type, EventType::FileRenamed);
    assert_eq!(events[0].file_path, away);
    assert_eq!(events[0].new_path, None);
    assert_eq!(events[1].event_type, EventType::FileRenamed);
    assert_eq!(events[1].file_path, arrived);
    assert_eq!(events[1].new_path, None);
    assert_eq!(fx.sidecar.read(&arrived), Some(Label::Confidential));
}

#[tokio::test]
async fn test_unknown_notification_on_monitored_file_is_logged() {
    let fx = fixture().await;
    let path = fx.tag("odd.txt", REPORT, Label::Secret).await;

    fx.change(RawAction::Unknown, &path).await;

    let events = fx.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::Unknown);
}

#[tokio::test]
async fn test_storage_outage_degrades_without_losing_state() {
    let fx = fixture_with_log(MemoryEventLog::failing(usize::MAX)).await;
    let original = fx.tag("report.xlsx", REPORT, Label::Confidential).await;
    let copy = fx.path("copy.xlsx");
    std::fs::copy(&original, &copy).unwrap();

    let classified = fx.change(RawAction::Created, &copy).await;

    assert_eq!(classified.degraded, 1);
    assert!(fx.events().is_empty());
    assert!(fx.watch_set.contains(&copy));
    assert_eq!(fx.classifier.recorder().degraded_count(), 1);
}

// ============================================================================
// Dispatch
// ============================================================================

#[tokio::test]
async fn test_no_event_loss_under_backpressure() {
    let fx = fixture_with_log(MemoryEventLog::slowed(Duration::from_millis(5))).await;
    let original = fx.tag("report.xlsx", REPORT, Label::Confidential).await;

    let mut copies = Vec::new();
    for i in 0..40 {
        let copy = fx.path(&format!("copies/{}.xlsx", i));
        std::fs::create_dir_all(copy.parent().unwrap()).unwrap();
        std::fs::copy(&original, &copy).unwrap();
        copies.push(copy);
    }

    let dispatcher = Dispatcher::spawn(
        fx.classifier.clone(),
        DispatcherConfig {
            workers: 2,
            queue_capacity: 2,
        },
    );
    for copy in &copies {
        let record = WatchRecord::Change(RawChange::new(RawAction::Created, copy));
        assert!(dispatcher.deliver(record).await);
    }
    dispatcher.shutdown(Duration::from_secs(30)).await;

    let events = fx.events();
    assert_eq!(events.len(), copies.len());
    let mut paths: Vec<_> = events.iter().map(|e| e.file_path.clone()).collect();
    paths.sort();
    paths.dedup();
    assert_eq!(paths.len(), copies.len());
    assert_eq!(dispatcher.classified(), 40);
}

#[tokio::test]
async fn test_same_path_records_keep_order() {
    let fx = fixture_with_log(MemoryEventLog::slowed(Duration::from_millis(2))).await;
    let original = fx.tag("report.xlsx", REPORT, Label::Confidential).await;
    let copy = fx.path("copy.xlsx");
    std::fs::copy(&original, &copy).unwrap();

    let dispatcher = Dispatcher::spawn(fx.classifier.clone(), DispatcherConfig::default());
    dispatcher
        .deliver(WatchRecord::Change(RawChange::new(RawAction::Created, &copy)))
        .await;
    // Only yields an event if the create above was classified first
    dispatcher
        .deliver(WatchRecord::Change(RawChange::new(RawAction::RenamedOld, &copy)))
        .await;
    dispatcher.shutdown(Duration::from_secs(10)).await;

    let kinds: Vec<_> = fx.events().iter().map(|e| e.event_type).collect();
    assert_eq!(kinds, vec![EventType::FileCreated, EventType::FileRenamed]);
}

/// First `<prefix><n>.txt` whose path is (or is not) on `shard` of a two-worker pool
fn name_on_shard(fx: &Fixture, prefix: &str, shard: usize, same: bool) -> String {
    (0..256)
        .map(|i| format!("{}{}.txt", prefix, i))
        .find(|name| (Dispatcher::shard_for(&fx.path(name), 2) == shard) == same)
        .unwrap()
}

#[tokio::test]
async fn test_rename_stays_ordered_with_later_records_on_its_source() {
    let fx = fixture_with_log(MemoryEventLog::slowed(Duration::from_millis(150))).await;
    let a = fx.path("a.txt");
    let shard_a = Dispatcher::shard_for(&a, 2);
    let b_name = name_on_shard(&fx, "b", shard_a, false);
    let b = fx.path(&b_name);
    let busy_name = name_on_shard(&fx, "busy", 1 - shard_a, true);

    // Keeps the destination shard occupied while the source shard is idle
    let busy = fx.tag(&busy_name, b"draft budget", Label::Internal).await;
    std::fs::write(&busy, b"final budget").unwrap();

    fx.tag("a.txt", REPORT, Label::Confidential).await;
    std::fs::rename(&a, &b).unwrap();
    // A scratch file briefly reuses the old name
    std::fs::write(&a, b"scratch").unwrap();
    std::fs::remove_file(&a).unwrap();

    let dispatcher = Dispatcher::spawn(
        fx.classifier.clone(),
        DispatcherConfig {
            workers: 2,
            queue_capacity: 8,
        },
    );
    dispatcher
        .deliver(WatchRecord::Change(RawChange::new(RawAction::Modified, &busy)))
        .await;
    dispatcher
        .deliver(WatchRecord::Rename {
            from: RawChange::new(RawAction::RenamedOld, &a),
            to: RawChange::new(RawAction::RenamedNew, &b),
        })
        .await;
    dispatcher
        .deliver(WatchRecord::Change(RawChange::new(RawAction::Deleted, &a)))
        .await;
    dispatcher.shutdown(Duration::from_secs(10)).await;

    let events: Vec<_> = fx
        .events()
        .into_iter()
        .map(|e| (e.event_type, e.file_path, e.new_path))
        .collect();
    assert_eq!(
        events,
        vec![
            (EventType::FileModified, busy, None),
            (EventType::FileRenamed, a, Some(b.clone())),
        ]
    );
    assert!(fx.watch_set.contains(&b));
}

#[tokio::test]
async fn test_crosswise_renames_do_not_deadlock() {
    let fx = fixture().await;
    let left = fx.path("left.txt");
    let shard_left = Dispatcher::shard_for(&left, 2);
    let right = fx.path(&name_on_shard(&fx, "right", shard_left, false));

    let dispatcher = Arc::new(Dispatcher::spawn(
        fx.classifier.clone(),
        DispatcherConfig {
            workers: 2,
            queue_capacity: 2,
        },
    ));

    let mut senders = Vec::new();
    for (from, to) in [(left.clone(), right.clone()), (right, left)] {
        let dispatcher = dispatcher.clone();
        senders.push(tokio::spawn(async move {
            for _ in 0..50 {
                let record = WatchRecord::Rename {
                    from: RawChange::new(RawAction::RenamedOld, &from),
                    to: RawChange::new(RawAction::RenamedNew, &to),
                };
                assert!(dispatcher.deliver(record).await);
            }
        }));
    }

    tokio::time::timeout(Duration::from_secs(10), async {
        for sender in senders {
            sender.await.unwrap();
        }
        dispatcher.shutdown(Duration::from_secs(5)).await;
    })
    .await
    .expect("renames deadlocked");
    assert_eq!(dispatcher.classified(), 100);
}

#[tokio::test]
async fn test_closed_dispatcher_refuses_records() {
    let fx = fixture().await;
    let dispatcher = Dispatcher::spawn(fx.classifier.clone(), DispatcherConfig::default());
    dispatcher.shutdown(Duration::from_secs(1)).await;

    assert!(dispatcher.is_closed());
    let record = WatchRecord::Change(RawChange::new(RawAction::Created, fx.path("x")));
    assert!(!dispatcher.deliver(record).await);
}

