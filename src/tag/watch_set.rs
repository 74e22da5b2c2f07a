//! Watch set - paths currently known to hold monitored content
//!
//! Seeded from the store's example paths when monitoring starts and kept
//! current by the classifier. Deleted files can no longer be hashed, so this
//! is the only way a delete is attributed to a label.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::core::types::{ContentHash, Label, TaggedFile};

/// What is known about a watched path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEntry {
    pub label: Label,
    pub content_hash: Option<ContentHash>,
}

/// Concurrent path -> label cache
#[derive(Debug, Default)]
pub struct WatchSet {
    entries: DashMap<PathBuf, WatchEntry>,
    /// Sidecar writes made by the agent itself, with when they happened
    self_writes: DashMap<PathBuf, Instant>,
}

impl WatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the contents with the example paths of `files` that still exist
    pub fn seed(&self, files: &[TaggedFile]) -> usize {
        self.entries.clear();
        self.self_writes.clear();
        for file in files {
            if let Some(path) = file.example_path.as_ref().filter(|p| p.is_file()) {
                self.insert(path, file.label.clone(), Some(file.content_hash.clone()));
            }
        }
        self.entries.len()
    }

    pub fn insert(&self, path: &Path, label: Label, content_hash: Option<ContentHash>) {
        self.entries.insert(
            path.to_path_buf(),
            WatchEntry {
                label,
                content_hash,
            },
        );
    }

    pub fn get(&self, path: &Path) -> Option<WatchEntry> {
        self.entries.get(path).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.contains_key(path)
    }

    pub fn remove(&self, path: &Path) -> Option<WatchEntry> {
        self.self_writes.remove(path);
        self.entries.remove(path).map(|(_, entry)| entry)
    }

    /// Move an entry to its new path, returning what was known about it
    pub fn rename(&self, from: &Path, to: &Path) -> Option<WatchEntry> {
        let entry = self.remove(from)?;
        self.entries.insert(to.to_path_buf(), entry.clone());
        Some(entry)
    }

    /// Remove every entry strictly below directory `dir`
    pub fn remove_under(&self, dir: &Path) -> Vec<(PathBuf, WatchEntry)> {
        let children: Vec<PathBuf> = self
            .entries
            .iter()
            .filter(|entry| entry.key() != dir && entry.key().starts_with(dir))
            .map(|entry| entry.key().clone())
            .collect();
        children
            .into_iter()
            .filter_map(|path| self.remove(&path).map(|entry| (path, entry)))
            .collect()
    }

    /// Re-root every entry below `from` under `to`, returning (old, new, entry)
    pub fn rename_under(&self, from: &Path, to: &Path) -> Vec<(PathBuf, PathBuf, WatchEntry)> {
        self.remove_under(from)
            .into_iter()
            .filter_map(|(old, entry)| {
                let relative = old.strip_prefix(from).ok()?;
                let new = to.join(relative);
                self.entries.insert(new.clone(), entry.clone());
                Some((old, new, entry))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.self_writes.clear();
    }

    /// Remember that the agent just wrote the sidecar on `path`
    pub fn note_self_write(&self, path: &Path) {
        self.self_writes.insert(path.to_path_buf(), Instant::now());
    }

    /// Whether an attribute change on `path` is the echo of our own write
    pub fn is_self_write(&self, path: &Path, window: Duration) -> bool {
        match self.self_writes.get(path).map(|at| *at.value()) {
            Some(at) if at.elapsed() <= window => true,
            Some(_) => {
                self.self_writes.remove(path);
                false
            }
            None => false,
        }
    }
}
