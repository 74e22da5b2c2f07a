//! Service wiring
//!
//! Opens both stores, builds the shared components and hands out the
//! controller and the tagging service that the API and the binary use.

pub mod controller;

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Duration;

use crate::classifier::{ClassifierConfig, DispatcherConfig};
use crate::config::AppConfig;
use crate::core::error::Result;
use crate::core::utils::{normalize_path, session_actor};
use crate::db::DatabaseConfig;
use crate::events::{AuditRecorder, EventPublisher, RecorderConfig, SqliteEventLog};
use crate::tag::{MonitoredFileResolver, NativeSidecar, SqliteTagStore, TaggingService, WatchSet};
use crate::watcher::{PathFilterConfig, WatcherConfig};

pub use controller::{
    ControllerConfig, MonitoredFile, MonitoringController, MonitoringStatus, WatcherStatus,
};

impl ControllerConfig {
    /// Controller settings from the `monitoring` section
    ///
    /// The data directory is always excluded from watching: the event log
    /// lives there and every append would come back as a notification.
    pub fn from_app(config: &AppConfig) -> Self {
        let monitoring = &config.monitoring;
        let data_dir = std::fs::canonicalize(&config.storage.data_dir)
            .unwrap_or_else(|_| normalize_path(&config.storage.data_dir));

        Self {
            volumes: monitoring.volumes.clone(),
            watcher: WatcherConfig {
                debounce: Duration::from_millis(monitoring.debounce_ms),
                rename_window: monitoring.rename_window(),
                backoff: Duration::from_millis(monitoring.watcher_backoff_ms),
                max_backoff: Duration::from_millis(monitoring.watcher_max_backoff_ms),
                channel_capacity: monitoring.queue_capacity,
                ..WatcherConfig::default()
            },
            dispatcher: DispatcherConfig {
                workers: monitoring.classifier_workers,
                queue_capacity: monitoring.queue_capacity,
            },
            classifier: ClassifierConfig {
                settle_window: monitoring.self_write_window(),
                actor: session_actor(),
            },
            filter: PathFilterConfig {
                exclude_patterns: monitoring.exclude_patterns.clone(),
                include_patterns: Vec::new(),
                excluded_roots: vec![data_dir],
            },
            stop_timeout: monitoring.stop_timeout(),
            max_recreations: 1,
        }
    }
}

/// The running agent's shared components
pub struct DlpServices {
    pub controller: Arc<MonitoringController>,
    pub tagging: Arc<TaggingService>,
}

impl DlpServices {
    /// Open the tag store and event log under the configured data directory
    pub async fn open(config: &AppConfig) -> Result<Self> {
        let storage = &config.storage;
        tokio::fs::create_dir_all(&storage.data_dir).await?;

        let tag_store = SqliteTagStore::open(
            &DatabaseConfig::with_path(storage.tag_db_path()).with_wal(storage.enable_wal),
        )
        .await?;
        let event_log = SqliteEventLog::open(
            &DatabaseConfig::with_path(storage.events_db_path()).with_wal(storage.enable_wal),
        )
        .await?;

        let store = Arc::new(tag_store);
        let sidecar = Arc::new(NativeSidecar::new(config.monitoring.sidecar_name.clone()));
        let watch_set = Arc::new(WatchSet::new());

        let recorder = Arc::new(AuditRecorder::new(
            Arc::new(event_log),
            EventPublisher::default(),
            RecorderConfig {
                max_retries: config.monitoring.append_max_retries,
                retry_base: Duration::from_millis(config.monitoring.append_retry_base_ms),
                ..RecorderConfig::default()
            },
        ));

        let resolver = MonitoredFileResolver::new(store.clone(), sidecar.clone());
        let controller = MonitoringController::new(
            resolver,
            watch_set.clone(),
            recorder,
            ControllerConfig::from_app(config),
        );
        let tagging = TaggingService::new(store, sidecar, watch_set);

        Ok(Self {
            controller: Arc::new(controller),
            tagging: Arc::new(tagging),
        })
    }
}
