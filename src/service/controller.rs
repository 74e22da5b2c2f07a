//! Monitoring Service Controller
//!
//! Owns the `Inactive -> Active -> Inactive` lifecycle. Starting seeds the
//! watch set from the tag store, spawns the classifier pool and one watcher
//! per volume; stopping tears them down in reverse with bounded waits.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::classifier::{ClassifierConfig, Dispatcher, DispatcherConfig, EventClassifier};
use crate::core::error::{DlpError, Result};
use crate::core::types::{ContentHash, Event, Label};
use crate::events::{AuditRecorder, DegradedWarning, EventSubscription};
use crate::tag::{MonitoredFileResolver, WatchSet};
use crate::watcher::{
    enumerate_volumes, PathFilter, PathFilterConfig, RecordSink, VolumeWatcher, WatcherConfig,
    WatcherExit, WatcherHandle, WatcherReport, WatcherState,
};

/// Controller tuning
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Roots to watch; empty means every local volume
    pub volumes: Vec<PathBuf>,
    pub watcher: WatcherConfig,
    pub dispatcher: DispatcherConfig,
    pub classifier: ClassifierConfig,
    pub filter: PathFilterConfig,
    /// Bound on each phase of `stop`
    pub stop_timeout: Duration,
    /// Re-creations attempted for an aborted watcher before giving up on its volume
    pub max_recreations: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            volumes: Vec::new(),
            watcher: WatcherConfig::default(),
            dispatcher: DispatcherConfig::default(),
            classifier: ClassifierConfig::default(),
            filter: PathFilterConfig::default(),
            stop_timeout: Duration::from_secs(5),
            max_recreations: 1,
        }
    }
}

/// Answer to `get_status`
#[derive(Debug, Clone, Serialize)]
pub struct MonitoringStatus {
    pub active: bool,
    pub watched_files: usize,
    pub degraded_warnings: usize,
    pub watchers: Vec<WatcherStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WatcherStatus {
    pub id: usize,
    pub root: PathBuf,
    pub state: WatcherState,
}

/// One row of `list_monitored_files`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonitoredFile {
    pub sha256: ContentHash,
    pub label: Label,
    pub path: Option<PathBuf>,
}

type SharedHandles = Arc<SyncMutex<Vec<WatcherHandle>>>;

/// Everything that exists only while monitoring is active
struct ActiveSession {
    dispatcher: Arc<Dispatcher>,
    watchers: SharedHandles,
    supervisor: JoinHandle<()>,
    supervisor_cancel: CancellationToken,
}

enum ControllerState {
    Inactive,
    Active(ActiveSession),
}

pub struct MonitoringController {
    resolver: MonitoredFileResolver,
    watch_set: Arc<WatchSet>,
    recorder: Arc<AuditRecorder>,
    config: ControllerConfig,
    state: Mutex<ControllerState>,
}

impl MonitoringController {
    pub fn new(
        resolver: MonitoredFileResolver,
        watch_set: Arc<WatchSet>,
        recorder: Arc<AuditRecorder>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            resolver,
            watch_set,
            recorder,
            config,
            state: Mutex::new(ControllerState::Inactive),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn watch_set(&self) -> &Arc<WatchSet> {
        &self.watch_set
    }

    pub async fn is_active(&self) -> bool {
        matches!(*self.state.lock().await, ControllerState::Active(_))
    }

    /// Start monitoring
    ///
    /// Returns `Ok(false)` when already active. Volumes that cannot be
    /// watched are logged and skipped; if none can, nothing is left running
    /// and the error is returned.
    pub async fn start(&self) -> Result<bool> {
        let mut state = self.state.lock().await;
        if matches!(*state, ControllerState::Active(_)) {
            return Ok(false);
        }

        self.seed_watch_set().await;

        let filter = Arc::new(PathFilter::new(self.config.filter.clone())?);
        let classifier = Arc::new(EventClassifier::new(
            self.resolver.clone(),
            self.watch_set.clone(),
            self.recorder.clone(),
            self.config.classifier.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::spawn(classifier, self.config.dispatcher.clone()));
        let (report_tx, report_rx) = mpsc::unbounded_channel();

        let volumes = enumerate_volumes(&self.config.volumes);
        let mut handles = Vec::with_capacity(volumes.len());
        let mut last_failure = None;
        for (id, root) in volumes.into_iter().enumerate() {
            let watcher = VolumeWatcher::new(
                id,
                root.clone(),
                self.config.watcher.clone(),
                filter.clone(),
                dispatcher.clone() as Arc<dyn RecordSink>,
            )
            .with_reports(report_tx.clone());

            match watcher.start().await {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    warn!(volume = %root.display(), error = %e, "Volume unavailable, skipping");
                    last_failure = Some(DlpError::from(e));
                }
            }
        }

        if handles.is_empty() {
            dispatcher.shutdown(self.config.stop_timeout).await;
            return Err(last_failure.unwrap_or_else(|| DlpError::VolumeUnavailable {
                volume: PathBuf::new(),
                reason: "no volumes to watch".to_string(),
            }));
        }

        info!(
            volumes = handles.len(),
            watched_files = self.watch_set.len(),
            "Monitoring started"
        );

        let watchers: SharedHandles = Arc::new(SyncMutex::new(handles));
        let supervisor_cancel = CancellationToken::new();
        let supervisor = Supervisor {
            watchers: watchers.clone(),
            filter,
            dispatcher: dispatcher.clone(),
            config: self.config.watcher.clone(),
            max_recreations: self.config.max_recreations,
            report_tx,
            recreations: HashMap::new(),
        };
        let supervisor = tokio::spawn(supervisor.run(report_rx, supervisor_cancel.clone()));

        *state = ControllerState::Active(ActiveSession {
            dispatcher,
            watchers,
            supervisor,
            supervisor_cancel,
        });
        Ok(true)
    }

    async fn seed_watch_set(&self) {
        match self.resolver.store().list_monitored().await {
            Ok(files) => {
                let seeded = self.watch_set.seed(&files);
                debug!(tagged = files.len(), seeded, "Seeded watch set");
            }
            Err(e) => {
                // Deletes go unattributed until files are seen again
                warn!(error = %e, "Could not seed watch set from the tag store");
                self.watch_set.clear();
            }
        }
    }

    /// Stop monitoring
    ///
    /// Returns false when already inactive. Watchers that miss the timeout
    /// are aborted and abandoned.
    pub async fn stop(&self) -> bool {
        let mut state = self.state.lock().await;
        let session = match std::mem::replace(&mut *state, ControllerState::Inactive) {
            ControllerState::Inactive => return false,
            ControllerState::Active(session) => session,
        };
        let timeout = self.config.stop_timeout;

        session.supervisor_cancel.cancel();
        let mut supervisor = session.supervisor;
        if tokio::time::timeout(timeout, &mut supervisor).await.is_err() {
            warn!("Watcher supervisor did not stop in time");
            supervisor.abort();
        }

        let handles: Vec<WatcherHandle> = session.watchers.lock().drain(..).collect();
        for handle in &handles {
            handle.stop();
        }
        let exits = futures::future::join_all(handles.into_iter().map(|handle| {
            let root = handle.root().to_path_buf();
            async move { (root, handle.join(timeout).await) }
        }))
        .await;
        for (root, exit) in exits {
            match exit {
                Some(exit) => debug!(volume = %root.display(), ?exit, "Watcher stopped"),
                None => warn!(volume = %root.display(), "Watcher abandoned"),
            }
        }

        session.dispatcher.shutdown(timeout).await;
        info!("Monitoring stopped");
        true
    }

    pub async fn get_status(&self) -> MonitoringStatus {
        let state = self.state.lock().await;
        let (active, watchers) = match &*state {
            ControllerState::Inactive => (false, Vec::new()),
            ControllerState::Active(session) => (
                true,
                session
                    .watchers
                    .lock()
                    .iter()
                    .map(|h| WatcherStatus {
                        id: h.id(),
                        root: h.root().to_path_buf(),
                        state: h.state(),
                    })
                    .collect(),
            ),
        };

        MonitoringStatus {
            active,
            watched_files: self.watch_set.len(),
            degraded_warnings: self.recorder.degraded_count(),
            watchers,
        }
    }

    pub async fn list_monitored_files(&self) -> Result<Vec<MonitoredFile>> {
        let files = self.resolver.store().list_monitored().await?;
        Ok(files
            .into_iter()
            .map(|file| MonitoredFile {
                sha256: file.content_hash,
                label: file.label,
                path: file.example_path,
            })
            .collect())
    }

    /// Most recent first
    pub async fn list_recent_events(&self, limit: usize) -> Result<Vec<Event>> {
        Ok(self.recorder.log().recent(limit).await?)
    }

    pub fn subscribe_events(&self) -> EventSubscription {
        self.recorder.subscribe()
    }

    pub fn degraded_warnings(&self) -> Vec<DegradedWarning> {
        self.recorder.degraded_warnings()
    }
}

/// Re-creates watchers whose notification handle was invalidated
struct Supervisor {
    watchers: SharedHandles,
    filter: Arc<PathFilter>,
    dispatcher: Arc<Dispatcher>,
    config: WatcherConfig,
    max_recreations: u32,
    report_tx: mpsc::UnboundedSender<WatcherReport>,
    recreations: HashMap<usize, u32>,
}

impl Supervisor {
    async fn run(
        mut self,
        mut reports: mpsc::UnboundedReceiver<WatcherReport>,
        cancel: CancellationToken,
    ) {
        loop {
            let report = tokio::select! {
                _ = cancel.cancelled() => break,
                report = reports.recv() => match report {
                    Some(report) => report,
                    None => break,
                },
            };

            match &report.exit {
                WatcherExit::Aborted { reason } => {
                    warn!(volume = %report.root.display(), reason = %reason, "Watcher aborted");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.backoff) => {}
                    }
                    self.recreate(report).await;
                }
                WatcherExit::SinkClosed => {
                    debug!(volume = %report.root.display(), "Watcher lost its sink");
                }
                WatcherExit::Cancelled => {}
            }
        }
    }

    async fn recreate(&mut self, report: WatcherReport) {
        let attempts = self.recreations.entry(report.id).or_insert(0);
        if *attempts >= self.max_recreations {
            error!(volume = %report.root.display(), "Giving up on volume");
            return;
        }
        *attempts += 1;

        let watcher = VolumeWatcher::new(
            report.id,
            report.root.clone(),
            self.config.clone(),
            self.filter.clone(),
            self.dispatcher.clone() as Arc<dyn RecordSink>,
        )
        .with_reports(self.report_tx.clone());

        match watcher.start().await {
            Ok(handle) => {
                info!(volume = %report.root.display(), "Watcher re-created");
                let mut watchers = self.watchers.lock();
                watchers.retain(|h| h.id() != report.id);
                watchers.push(handle);
            }
            Err(e) => {
                error!(volume = %report.root.display(), error = %e, "Could not re-create watcher, giving up on volume");
            }
        }
    }
}
