//! Volume Watcher Module
//!
//! One watcher per volume root. Each runs a recursive notify subscription,
//! translates notifications into raw change records, pairs rename halves
//! and hands the result to a bounded sink. A full sink blocks the watcher's
//! next receive; records are never dropped to make room.
//!
//! Per-watcher state machine: `Idle -> Streaming -> (Backoff -> Streaming)* -> Stopped`.

mod correlate;
mod error;
mod filter;
mod volumes;

pub use correlate::RenameCorrelator;
pub use error::WatchError;
pub use filter::{default_exclude_patterns, FilterReason, FilterResult, PathFilter, PathFilterConfig};
pub use volumes::enumerate_volumes;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::error::{ErrorRecovery, RecoveryAction};

/// Raw change action, before classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawAction {
    Created,
    Modified,
    Deleted,
    /// Old-name half of a rename
    RenamedOld,
    /// New-name half of a rename
    RenamedNew,
    AttributeChanged,
    /// A writer closed the file
    WriteClosed,
    /// Notification that maps to none of the above
    Unknown,
}

/// One accepted notification for one path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChange {
    pub action: RawAction,
    pub path: PathBuf,
    /// Platform id linking the halves of a rename
    pub tracker: Option<usize>,
    /// Id of the watcher that observed the change
    pub watcher: usize,
    pub observed_at: Instant,
}

impl RawChange {
    pub fn new(action: RawAction, path: impl Into<PathBuf>) -> Self {
        Self {
            action,
            path: path.into(),
            tracker: None,
            watcher: 0,
            observed_at: Instant::now(),
        }
    }

    pub fn with_tracker(mut self, tracker: usize) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn with_watcher(mut self, watcher: usize) -> Self {
        self.watcher = watcher;
        self
    }
}

/// What a watcher hands to the classifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchRecord {
    /// A single change, including a rename half that found no partner
    Change(RawChange),
    /// Both halves of a rename
    Rename { from: RawChange, to: RawChange },
}

impl WatchRecord {
    /// Path that decides which worker handles the record
    pub fn routing_path(&self) -> &Path {
        match self {
            WatchRecord::Change(change) => &change.path,
            WatchRecord::Rename { to, .. } => &to.path,
        }
    }
}

/// Destination for watch records
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Hand over a record, waiting for queue space. False once the sink is closed.
    async fn deliver(&self, record: WatchRecord) -> bool;
}

#[async_trait]
impl RecordSink for mpsc::Sender<WatchRecord> {
    async fn deliver(&self, record: WatchRecord) -> bool {
        self.send(record).await.is_ok()
    }
}

/// Watcher lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatcherState {
    Idle,
    Streaming,
    Backoff,
    Stopped,
}

/// Why a watcher stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherExit {
    /// Stop was requested
    Cancelled,
    /// The notification handle became unusable
    Aborted { reason: String },
    /// The record sink went away
    SinkClosed,
}

/// Sent when a watcher task ends
#[derive(Debug, Clone)]
pub struct WatcherReport {
    pub id: usize,
    pub root: PathBuf,
    pub exit: WatcherExit,
}

/// Configuration for a VolumeWatcher
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Repeated modifications of one path within this window collapse into one
    pub debounce: Duration,
    /// How long a rename half waits for its partner
    pub rename_window: Duration,
    /// First delay after a transient read error
    pub backoff: Duration,
    pub max_backoff: Duration,
    /// Buffer between the notify thread and the watcher task
    pub channel_capacity: usize,
    /// How often the root is checked for disappearance
    pub health_check_interval: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(100),
            rename_window: Duration::from_millis(500),
            backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_millis(30_000),
            channel_capacity: 1024,
            health_check_interval: Duration::from_secs(5),
        }
    }
}

/// Leading-edge debounce of repeated modifications
#[derive(Debug)]
struct Debouncer {
    window: Duration,
    last: HashMap<PathBuf, (RawAction, Instant)>,
}

impl Debouncer {
    const PRUNE_THRESHOLD: usize = 4096;

    fn new(window: Duration) -> Self {
        Self {
            window,
            last: HashMap::new(),
        }
    }

    /// Whether `action` on `path` repeats one accepted within the window
    fn is_repeat(&mut self, path: &Path, action: RawAction, now: Instant) -> bool {
        if !matches!(action, RawAction::Modified | RawAction::AttributeChanged) {
            self.last.remove(path);
            return false;
        }

        if let Some((last_action, seen)) = self.last.get(path) {
            if *last_action == action && now.duration_since(*seen) < self.window {
                return true;
            }
        }

        if self.last.len() >= Self::PRUNE_THRESHOLD {
            let window = self.window;
            self.last.retain(|_, (_, seen)| now.duration_since(*seen) < window);
        }
        self.last.insert(path.to_path_buf(), (action, now));
        false
    }
}

/// Map a notify event kind onto a raw action for one of its paths
pub fn raw_action(kind: &EventKind, path: &Path) -> Option<RawAction> {
    match kind {
        EventKind::Create(_) => Some(RawAction::Created),
        EventKind::Remove(_) => Some(RawAction::Deleted),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some(RawAction::RenamedOld),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some(RawAction::RenamedNew),
        // Duplicates the From/To halves that are also delivered
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => None,
        EventKind::Modify(ModifyKind::Name(_)) => Some(if path.exists() {
            RawAction::RenamedNew
        } else {
            RawAction::RenamedOld
        }),
        EventKind::Modify(ModifyKind::Metadata(_)) => Some(RawAction::AttributeChanged),
        EventKind::Modify(_) => Some(RawAction::Modified),
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => Some(RawAction::WriteClosed),
        EventKind::Access(_) => None,
        EventKind::Any | EventKind::Other => Some(RawAction::Unknown),
    }
}

/// Watches one volume root
pub struct VolumeWatcher {
    id: usize,
    root: PathBuf,
    config: WatcherConfig,
    filter: Arc<PathFilter>,
    sink: Arc<dyn RecordSink>,
    reports: Option<mpsc::UnboundedSender<WatcherReport>>,
}

impl VolumeWatcher {
    pub fn new(
        id: usize,
        root: impl Into<PathBuf>,
        config: WatcherConfig,
        filter: Arc<PathFilter>,
        sink: Arc<dyn RecordSink>,
    ) -> Self {
        Self {
            id,
            root: root.into(),
            config,
            filter,
            sink,
            reports: None,
        }
    }

    /// Send a report here when the watcher task ends
    pub fn with_reports(mut self, reports: mpsc::UnboundedSender<WatcherReport>) -> Self {
        self.reports = Some(reports);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Subscribe to the root and start streaming
    ///
    /// Establishing a recursive subscription walks the tree, so it runs on
    /// the blocking pool. Fails with `WatchError::Setup` if the root cannot
    /// be watched.
    pub async fn start(self) -> Result<WatcherHandle, WatchError> {
        let (raw_tx, raw_rx) = mpsc::channel(self.config.channel_capacity.max(1));

        let root = self.root.clone();
        let watcher = tokio::task::spawn_blocking(move || subscribe(&root, raw_tx))
            .await
            .map_err(|e| WatchError::Setup {
                volume: self.root.clone(),
                reason: e.to_string(),
            })??;

        tracing::info!(volume = %self.root.display(), watcher = self.id, "Watching volume");
        Ok(self.launch(watcher, raw_rx))
    }

    /// Stream from a notification channel fed by someone other than notify
    #[cfg(test)]
    pub(crate) fn start_with_stream(
        self,
        raw_rx: mpsc::Receiver<notify::Result<Event>>,
    ) -> WatcherHandle {
        self.launch((), raw_rx)
    }

    /// Spawn the streaming task; `subscription` lives until the task ends
    fn launch<S>(self, subscription: S, raw_rx: mpsc::Receiver<notify::Result<Event>>) -> WatcherHandle
    where
        S: Send + 'static,
    {
        let state = Arc::new(RwLock::new(WatcherState::Streaming));
        let cancel = CancellationToken::new();
        let id = self.id;
        let root = self.root.clone();
        let task = tokio::spawn(self.run(subscription, raw_rx, state.clone(), cancel.clone()));

        WatcherHandle {
            id,
            root,
            state,
            cancel,
            task,
        }
    }

    async fn run<S>(
        self,
        subscription: S,
        mut raw_rx: mpsc::Receiver<notify::Result<Event>>,
        state: Arc<RwLock<WatcherState>>,
        cancel: CancellationToken,
    ) -> WatcherExit
    where
        S: Send + 'static,
    {
        enum Step {
            Cancelled,
            Expire,
            Notify(Option<notify::Result<Event>>),
            HealthCheck,
        }

        let mut correlator = RenameCorrelator::new(self.config.rename_window);
        let mut debouncer = Debouncer::new(self.config.debounce);
        let mut backoff = self.config.backoff;
        let mut health = tokio::time::interval(self.config.health_check_interval);
        health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let exit = loop {
            let deadline = correlator.next_deadline();
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Cancelled,
                _ = sleep_until(deadline) => Step::Expire,
                msg = raw_rx.recv() => Step::Notify(msg),
                _ = health.tick() => Step::HealthCheck,
            };

            match step {
                Step::Cancelled => break WatcherExit::Cancelled,
                Step::Expire => {
                    let ready = correlator.expire(Instant::now());
                    if let Some(exit) = self.forward_all(ready, &cancel).await {
                        break exit;
                    }
                }
                Step::Notify(None) => {
                    break WatcherExit::Aborted {
                        reason: "notification stream closed".to_string(),
                    }
                }
                Step::Notify(Some(Ok(event))) => {
                    backoff = self.config.backoff;
                    let now = Instant::now();
                    let changes = self.translate(event, &mut debouncer, now);

                    if changes
                        .iter()
                        .any(|c| c.action == RawAction::Deleted && c.path == self.root)
                    {
                        break WatcherExit::Aborted {
                            reason: "volume root removed".to_string(),
                        };
                    }

                    let mut ready = Vec::new();
                    for change in changes {
                        ready.extend(correlator.push(change, now));
                    }
                    if let Some(exit) = self.forward_all(ready, &cancel).await {
                        break exit;
                    }
                }
                Step::Notify(Some(Err(err))) => {
                    let err = WatchError::from_notify(&self.root, err);
                    if err.recovery_action() != RecoveryAction::Retry {
                        break WatcherExit::Aborted {
                            reason: err.to_string(),
                        };
                    }

                    tracing::warn!(
                        volume = %self.root.display(),
                        error = %err,
                        delay_ms = backoff.as_millis() as u64,
                        "Transient watch error, backing off"
                    );
                    *state.write() = WatcherState::Backoff;
                    tokio::select! {
                        _ = cancel.cancelled() => break WatcherExit::Cancelled,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = next_backoff(backoff, self.config.max_backoff);
                    *state.write() = WatcherState::Streaming;
                }
                Step::HealthCheck => {
                    if !self.root.exists() {
                        break WatcherExit::Aborted {
                            reason: "volume root no longer exists".to_string(),
                        };
                    }
                }
            }
        };

        // Close the channel first so a notify thread blocked on it can exit
        drop(raw_rx);
        drop(subscription);
        self.flush_pending(&mut correlator).await;
        *state.write() = WatcherState::Stopped;

        match &exit {
            WatcherExit::Cancelled => {
                tracing::info!(volume = %self.root.display(), watcher = self.id, "Watcher stopped")
            }
            other => tracing::error!(
                volume = %self.root.display(),
                watcher = self.id,
                exit = ?other,
                "Watcher terminated"
            ),
        }

        if let Some(reports) = &self.reports {
            let _ = reports.send(WatcherReport {
                id: self.id,
                root: self.root.clone(),
                exit: exit.clone(),
            });
        }

        exit
    }

    fn translate(&self, event: Event, debouncer: &mut Debouncer, now: Instant) -> Vec<RawChange> {
        if event.need_rescan() {
            tracing::warn!(
                volume = %self.root.display(),
                "Notification queue overflowed, changes may have been missed"
            );
        }

        let tracker = event.attrs.tracker();
        let mut changes = Vec::with_capacity(event.paths.len());
        for path in event.paths {
            if self.filter.is_excluded(&path) {
                continue;
            }
            let Some(action) = raw_action(&event.kind, &path) else {
                continue;
            };
            if debouncer.is_repeat(&path, action, now) {
                continue;
            }

            changes.push(RawChange {
                action,
                path,
                tracker,
                watcher: self.id,
                observed_at: now,
            });
        }
        changes
    }

    /// Forward records in order, returning an exit reason if forwarding must stop
    async fn forward_all(
        &self,
        records: Vec<WatchRecord>,
        cancel: &CancellationToken,
    ) -> Option<WatcherExit> {
        for record in records {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Some(WatcherExit::Cancelled),
                delivered = self.sink.deliver(record) => {
                    if !delivered {
                        return Some(WatcherExit::SinkClosed);
                    }
                }
            }
        }
        None
    }

    /// Hand over rename halves still waiting for a partner
    async fn flush_pending(&self, correlator: &mut RenameCorrelator) {
        const FLUSH_TIMEOUT: Duration = Duration::from_millis(250);

        for record in correlator.drain() {
            if tokio::time::timeout(FLUSH_TIMEOUT, self.sink.deliver(record))
                .await
                .map_or(true, |delivered| !delivered)
            {
                tracing::warn!(volume = %self.root.display(), "Dropped unpaired rename half at shutdown");
                break;
            }
        }
    }
}

fn subscribe(
    root: &Path,
    raw_tx: mpsc::Sender<notify::Result<Event>>,
) -> Result<RecommendedWatcher, WatchError> {
    let setup_error = |e: notify::Error| WatchError::Setup {
        volume: root.to_path_buf(),
        reason: e.to_string(),
    };

    // Runs on the notify thread; blocking here is what propagates backpressure
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        let _ = raw_tx.blocking_send(res);
    })
    .map_err(setup_error)?;

    watcher
        .watch(root, RecursiveMode::Recursive)
        .map_err(setup_error)?;

    Ok(watcher)
}

/// Delay after another transient error: doubled, capped at `max`
pub(crate) fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

/// Handle to a running watcher
pub struct WatcherHandle {
    id: usize,
    root: PathBuf,
    state: Arc<RwLock<WatcherState>>,
    cancel: CancellationToken,
    task: JoinHandle<WatcherExit>,
}

impl WatcherHandle {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state(&self) -> WatcherState {
        *self.state.read()
    }

    /// Signal the watcher to stop. Interrupts a pending receive or a wait for queue space.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait up to `timeout` for the task to end
    ///
    /// A task still running after the timeout is aborted and abandoned;
    /// `None` is returned in that case and when the task panicked.
    pub async fn join(self, timeout: Duration) -> Option<WatcherExit> {
        let mut task = self.task;
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(exit)) => Some(exit),
            Ok(Err(e)) => {
                tracing::error!(volume = %self.root.display(), error = %e, "Watcher task failed");
                None
            }
            Err(_) => {
                tracing::warn!(
                    volume = %self.root.display(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Watcher did not stop in time, abandoning"
                );
                task.abort();
                *self.state.write() = WatcherState::Stopped;
                None
            }
        }
    }
}
