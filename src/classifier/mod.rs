//! Event Classifier & Propagator
//!
//! Turns watch records into labelled audit events:
//! - Resolves each affected path (deletes use the watch set, the file is gone)
//! - Drops churn on files that are not monitored
//! - Re-applies the label to new copies of tagged content (propagation)
//! - Hands events to the audit recorder
//!
//! Records for one path arrive in watcher order because the dispatcher
//! shards by path and orders each rename on both of its paths. Nothing here returns an error: failures are logged and
//! the record is dropped or degraded.

pub mod dispatch;

#[cfg(test)]
mod tests;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, trace, warn};

use crate::core::error::{DlpError, ErrorRecovery, RecoveryAction};
use crate::core::types::{ContentHash, EventType, NewEvent};
use crate::core::utils::session_actor;
use crate::events::{AuditRecorder, Recorded};
use crate::tag::{MonitoredFileResolver, Resolution, WatchSet};
use crate::watcher::{RawAction, RawChange, WatchRecord};

pub use dispatch::{Dispatcher, DispatcherConfig};

/// How long a create that did not resolve yet may be completed by a later write
pub const PENDING_CREATE_TTL: Duration = Duration::from_secs(60);

/// Size at which the per-path bookkeeping maps are pruned
const PRUNE_THRESHOLD: usize = 4096;

const DETAILS_CREATED: &str = "File created/copied";
const DETAILS_MODIFIED: &str = "File content changed";
const DETAILS_ATTRIBUTES: &str = "File attributes changed";
const DETAILS_DELETED: &str = "File deleted";
const DETAILS_RENAMED: &str = "File renamed/moved";
const DETAILS_RENAMED_AWAY: &str = "File renamed/moved, destination not observed";
const DETAILS_RENAMED_IN: &str = "File renamed/moved, origin not observed";
const DETAILS_UNKNOWN: &str = "Unrecognized change notification";

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// Attribute changes on a path the agent just tagged are ignored for this long.
    /// The same window collapses repeated notifications for unchanged content.
    pub settle_window: Duration,
    /// Identity written into every event
    pub actor: String,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            settle_window: Duration::from_millis(2000),
            actor: session_actor(),
        }
    }
}

/// What a record turned into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Classified {
    pub logged: usize,
    pub degraded: usize,
}

impl Classified {
    fn add(&mut self, recorded: &Recorded) {
        match recorded {
            Recorded::Logged(_) => self.logged += 1,
            Recorded::Degraded(_) => self.degraded += 1,
        }
    }

    fn merge(&mut self, other: Classified) {
        self.logged += other.logged;
        self.degraded += other.degraded;
    }

    pub fn total(&self) -> usize {
        self.logged + self.degraded
    }
}

pub struct EventClassifier {
    resolver: MonitoredFileResolver,
    watch_set: Arc<WatchSet>,
    recorder: Arc<AuditRecorder>,
    config: ClassifierConfig,
    /// Creates that did not resolve yet (file still being written)
    pending_creates: DashMap<PathBuf, Instant>,
    /// Hash last logged per path, with when
    recent: DashMap<PathBuf, (ContentHash, Instant)>,
}

impl EventClassifier {
    pub fn new(
        resolver: MonitoredFileResolver,
        watch_set: Arc<WatchSet>,
        recorder: Arc<AuditRecorder>,
        config: ClassifierConfig,
    ) -> Self {
        Self {
            resolver,
            watch_set,
            recorder,
            config,
            pending_creates: DashMap::new(),
            recent: DashMap::new(),
        }
    }

    pub fn watch_set(&self) -> &Arc<WatchSet> {
        &self.watch_set
    }

    pub fn recorder(&self) -> &Arc<AuditRecorder> {
        &self.recorder
    }

    pub async fn handle(&self, record: WatchRecord) -> Classified {
        match record {
            WatchRecord::Rename { from, to } => self.on_rename(&from.path, &to.path).await,
            WatchRecord::Change(change) => self.on_change(change).await,
        }
    }

    async fn on_change(&self, change: RawChange) -> Classified {
        let path = change.path.as_path();
        match change.action {
            RawAction::Created => self.on_created(path).await,
            RawAction::Modified | RawAction::WriteClosed => self.on_modified(path, DETAILS_MODIFIED).await,
            RawAction::AttributeChanged => {
                if self.watch_set.is_self_write(path, self.config.settle_window) {
                    trace!(path = %path.display(), "Ignoring echo of own sidecar write");
                    return Classified::default();
                }
                self.on_modified(path, DETAILS_ATTRIBUTES).await
            }
            RawAction::Deleted => self.on_deleted(path).await,
            RawAction::RenamedOld => self.on_renamed_away(path).await,
            RawAction::RenamedNew => self.on_renamed_in(path).await,
            RawAction::Unknown => self.on_unknown(path).await,
        }
    }

    async fn on_created(&self, path: &Path) -> Classified {
        match tokio::fs::symlink_metadata(path).await {
            Ok(metadata) if metadata.is_dir() => {
                let mut classified = Classified::default();
                for file in scan_files(path).await {
                    classified.merge(self.on_created_file(&file).await);
                }
                classified
            }
            Ok(metadata) if metadata.is_file() => self.on_created_file(path).await,
            Ok(_) => Classified::default(),
            Err(e) => {
                trace!(path = %path.display(), error = %e, "Created path vanished before classification");
                Classified::default()
            }
        }
    }

    async fn on_created_file(&self, path: &Path) -> Classified {
        let resolution = self.resolver.resolve(path).await;
        if !resolution.monitored {
            self.mark_pending(path);
            return Classified::default();
        }
        self.pending_creates.remove(path);
        self.emit_created(path, resolution, EventType::FileCreated, DETAILS_CREATED)
            .await
    }

    /// Record a file that appeared, re-tagging it when its sidecar is missing or stale
    async fn emit_created(
        &self,
        path: &Path,
        resolution: Resolution,
        event_type: EventType,
        details: &str,
    ) -> Classified {
        if !self.claim(path, resolution.content_hash.as_ref()) {
            trace!(path = %path.display(), "Duplicate notification for unchanged content");
            return Classified::default();
        }
        self.propagate(path, &resolution).await;
        self.remember(path, &resolution);
        self.record(
            NewEvent::new(event_type, path)
                .with_label(resolution.label)
                .with_hash(resolution.content_hash)
                .with_details(details),
        )
        .await
    }

    async fn propagate(&self, path: &Path, resolution: &Resolution) {
        let (Some(label), Some(hash)) = (&resolution.indexed_label, &resolution.content_hash) else {
            return;
        };

        if resolution.sidecar_stale() {
            self.watch_set.note_self_write(path);
            let written = self.resolver.sidecar().write(path, label).await;
            match written.map_err(DlpError::from) {
                Ok(()) => debug!(path = %path.display(), label = %label, "Propagated label to copy"),
                Err(e) => match e.recovery_action() {
                    RecoveryAction::Degrade => {
                        debug!(path = %path.display(), error = %e, "Sidecar unavailable, content index only")
                    }
                    // The copy was moved or deleted again; its own record follows
                    RecoveryAction::Skip => trace!(path = %path.display(), error = %e, "Copy vanished before propagation"),
                    _ => warn!(path = %path.display(), error = %e, "Label propagation failed"),
                },
            }
        }

        if let Err(e) = self.resolver.store().update_example_path(hash, path).await {
            warn!(path = %path.display(), error = %e, "Failed to update example path");
        }
    }

    async fn on_modified(&self, path: &Path, details: &str) -> Classified {
        let resolution = self.resolver.resolve(path).await;
        if !resolution.monitored {
            return Classified::default();
        }

        if self.take_pending(path) {
            return self
                .emit_created(path, resolution, EventType::FileCreated, DETAILS_CREATED)
                .await;
        }

        if !self.claim(path, resolution.content_hash.as_ref()) {
            trace!(path = %path.display(), "Duplicate notification for unchanged content");
            return Classified::default();
        }
        self.remember(path, &resolution);
        self.record(
            NewEvent::new(EventType::FileModified, path)
                .with_label(resolution.label)
                .with_hash(resolution.content_hash)
                .with_details(details),
        )
        .await
    }

    async fn on_deleted(&self, path: &Path) -> Classified {
        self.pending_creates.remove(path);
        self.recent.remove(path);

        let removed = match self.watch_set.remove(path) {
            Some(entry) => vec![(path.to_path_buf(), entry)],
            None => self.watch_set.remove_under(path),
        };

        let mut classified = Classified::default();
        for (removed_path, entry) in removed {
            self.recent.remove(&removed_path);
            let outcome = self
                .record(
                    NewEvent::new(EventType::FileDeleted, &removed_path)
                        .with_label(Some(entry.label))
                        .with_hash(entry.content_hash)
                        .with_details(DETAILS_DELETED),
                )
                .await;
            classified.merge(outcome);
        }
        classified
    }

    async fn on_rename(&self, from: &Path, to: &Path) -> Classified {
        self.pending_creates.remove(from);
        if let Some((_, recent)) = self.recent.remove(from) {
            self.recent.insert(to.to_path_buf(), recent);
        }

        if tokio::fs::symlink_metadata(to)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return self.on_directory_rename(from, to).await;
        }

        let cached = self.watch_set.rename(from, to);
        let resolution = self.resolver.resolve(to).await;

        let (label, hash) = if resolution.monitored {
            if let Some(hash) = &resolution.content_hash {
                if let Err(e) = self.resolver.store().update_example_path(hash, to).await {
                    warn!(path = %to.display(), error = %e, "Failed to update example path");
                }
            }
            self.remember(to, &resolution);
            (resolution.label, resolution.content_hash)
        } else if let Some(entry) = cached {
            // Known monitored a moment ago; the new name could not be read
            self.watch_set.insert(to, entry.label.clone(), entry.content_hash.clone());
            (Some(entry.label), entry.content_hash)
        } else {
            return Classified::default();
        };

        self.record(
            NewEvent::new(EventType::FileRenamed, from)
                .with_new_path(to)
                .with_label(label)
                .with_hash(hash)
                .with_details(DETAILS_RENAMED),
        )
        .await
    }

    /// One rename event per watched file below the moved directory
    async fn on_directory_rename(&self, from: &Path, to: &Path) -> Classified {
        let mut classified = Classified::default();
        for (old, new, entry) in self.watch_set.rename_under(from, to) {
            if let Some((_, recent)) = self.recent.remove(&old) {
                self.recent.insert(new.clone(), recent);
            }
            if let Some(hash) = &entry.content_hash {
                if let Err(e) = self.resolver.store().update_example_path(hash, &new).await {
                    warn!(path = %new.display(), error = %e, "Failed to update example path");
                }
            }
            let outcome = self
                .record(
                    NewEvent::new(EventType::FileRenamed, &old)
                        .with_new_path(&new)
                        .with_label(Some(entry.label))
                        .with_hash(entry.content_hash)
                        .with_details(DETAILS_RENAMED),
                )
                .await;
            classified.merge(outcome);
        }
        classified
    }

    /// Old half of a rename whose new half never arrived
    async fn on_renamed_away(&self, path: &Path) -> Classified {
        self.pending_creates.remove(path);
        self.recent.remove(path);

        let removed = match self.watch_set.remove(path) {
            Some(entry) => vec![(path.to_path_buf(), entry)],
            None => self.watch_set.remove_under(path),
        };

        let mut classified = Classified::default();
        for (old, entry) in removed {
            self.recent.remove(&old);
            let outcome = self
                .record(
                    NewEvent::new(EventType::FileRenamed, &old)
                        .with_label(Some(entry.label))
                        .with_hash(entry.content_hash)
                        .with_details(DETAILS_RENAMED_AWAY),
                )
                .await;
            classified.merge(outcome);
        }
        classified
    }

    /// New half of a rename whose old half never arrived
    async fn on_renamed_in(&self, path: &Path) -> Classified {
        let files = match tokio::fs::symlink_metadata(path).await {
            Ok(metadata) if metadata.is_dir() => scan_files(path).await,
            Ok(metadata) if metadata.is_file() => vec![path.to_path_buf()],
            _ => return Classified::default(),
        };

        let mut classified = Classified::default();
        for file in files {
            let resolution = self.resolver.resolve(&file).await;
            if !resolution.monitored {
                continue;
            }
            let outcome = self
                .emit_created(&file, resolution, EventType::FileRenamed, DETAILS_RENAMED_IN)
                .await;
            classified.merge(outcome);
        }
        classified
    }

    async fn on_unknown(&self, path: &Path) -> Classified {
        let resolution = self.resolver.resolve(path).await;
        let (label, hash) = if resolution.monitored {
            self.remember(path, &resolution);
            (resolution.label, resolution.content_hash)
        } else if let Some(entry) = self.watch_set.get(path) {
            (Some(entry.label), entry.content_hash)
        } else {
            return Classified::default();
        };

        self.record(
            NewEvent::new(EventType::Unknown, path)
                .with_label(label)
                .with_hash(hash)
                .with_details(DETAILS_UNKNOWN),
        )
        .await
    }

    async fn record(&self, event: NewEvent) -> Classified {
        let event = event.with_actor(self.config.actor.clone());
        let mut classified = Classified::default();
        classified.add(&self.recorder.record(event).await);
        classified
    }

    fn remember(&self, path: &Path, resolution: &Resolution) {
        if let Some(label) = &resolution.label {
            self.watch_set
                .insert(path, label.clone(), resolution.content_hash.clone());
        }
    }

    /// Claim the right to log `hash` for `path`
    ///
    /// False when the same content was logged for the path within the settle
    /// window. Unhashable content is always logged.
    fn claim(&self, path: &Path, hash: Option<&ContentHash>) -> bool {
        let Some(hash) = hash else {
            return true;
        };
        let now = Instant::now();
        let window = self.config.settle_window;

        if self.recent.len() > PRUNE_THRESHOLD {
            self.recent
                .retain(|_, (_, at)| now.duration_since(*at) <= window);
        }

        match self.recent.entry(path.to_path_buf()) {
            Entry::Occupied(mut occupied) => {
                let (last, at) = occupied.get();
                if last == hash && now.duration_since(*at) <= window {
                    return false;
                }
                occupied.insert((hash.clone(), now));
                true
            }
            Entry::Vacant(vacant) => {
                vacant.insert((hash.clone(), now));
                true
            }
        }
    }

    fn mark_pending(&self, path: &Path) {
        let now = Instant::now();
        if self.pending_creates.len() > PRUNE_THRESHOLD {
            self.pending_creates
                .retain(|_, at| now.duration_since(*at) <= PENDING_CREATE_TTL);
        }
        self.pending_creates.insert(path.to_path_buf(), now);
    }

    fn take_pending(&self, path: &Path) -> bool {
        match self.pending_creates.remove(path) {
            Some((_, at)) => at.elapsed() <= PENDING_CREATE_TTL,
            None => false,
        }
    }
}

/// Regular files below `root`, symlinks not followed
async fn scan_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!(path = %dir.display(), error = %e, "Cannot scan directory");
                continue;
            }
        };
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => match entry.file_type().await {
                    Ok(ft) if ft.is_dir() => stack.push(entry.path()),
                    Ok(ft) if ft.is_file() => files.push(entry.path()),
                    _ => {}
                },
                Ok(None) => break,
                Err(e) => {
                    debug!(path = %dir.display(), error = %e, "Directory scan interrupted");
                    break;
                }
            }
        }
    }
    files
}

