//! Tagging surface used by operator tools
//!
//! Tagging writes the sidecar and registers the content hash. The store
//! registration is what makes a file monitored; a sidecar that cannot be
//! written is logged and otherwise ignored.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::core::error::{DlpError, Result};
use crate::core::types::{ContentHash, Label};
use crate::core::utils::hash_file;

use super::sidecar::{AsyncSidecar, SidecarAccessor};
use super::store::TagStore;
use super::watch_set::WatchSet;

/// Outcome of tagging one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagOutcome {
    pub path: PathBuf,
    pub content_hash: ContentHash,
    pub label: Label,
    pub sidecar_written: bool,
}

/// Outcome of removing a tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UntagOutcome {
    pub sidecar_removed: bool,
    pub store_removed: bool,
}

/// Both tag sources for one path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathQuery {
    pub sidecar_label: Option<Label>,
    pub store_label: Option<Label>,
    pub content_hash: Option<ContentHash>,
}

/// Per-file progress of a recursive tagging run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagProgress {
    pub path: PathBuf,
    pub ok: bool,
    pub succeeded: usize,
    pub failed: usize,
    pub error: Option<String>,
}

/// Totals of a recursive tagging run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeOutcome {
    pub succeeded: usize,
    pub failed: usize,
}

/// Tag, untag and query paths
#[derive(Clone)]
pub struct TaggingService {
    store: Arc<dyn TagStore>,
    sidecar: AsyncSidecar,
    watch_set: Arc<WatchSet>,
}

impl TaggingService {
    pub fn new(
        store: Arc<dyn TagStore>,
        sidecar: Arc<dyn SidecarAccessor>,
        watch_set: Arc<WatchSet>,
    ) -> Self {
        Self {
            store,
            sidecar: AsyncSidecar::new(sidecar),
            watch_set,
        }
    }

    /// Tag a single file with `label`
    pub async fn tag_path(&self, path: &Path, label: &Label) -> Result<TagOutcome> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| DlpError::from_io(path, e))?;
        if !metadata.is_file() {
            return Err(DlpError::InvalidInput(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        // Every empty file shares one hash; tagging it would tag them all
        if metadata.len() == 0 {
            return Err(DlpError::InvalidInput(format!(
                "{} is empty",
                path.display()
            )));
        }

        let content_hash = hash_file(path).await?;

        // The index entry must exist before the sidecar does
        self.store.register(&content_hash, label, path).await?;

        self.watch_set.note_self_write(path);
        let sidecar_written = match self.sidecar.write(path, label).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Sidecar write failed, content index only");
                false
            }
        };

        self.watch_set
            .insert(path, label.clone(), Some(content_hash.clone()));

        tracing::info!(path = %path.display(), label = %label, hash = %content_hash.short(), "Tagged file");

        Ok(TagOutcome {
            path: path.to_path_buf(),
            content_hash,
            label: label.clone(),
            sidecar_written,
        })
    }

    /// Remove the sidecar and the index entry for the file's content
    ///
    /// Other copies of the same content stop being monitored as well, since
    /// they share the index entry.
    pub async fn untag_path(&self, path: &Path) -> Result<UntagOutcome> {
        let content_hash = hash_file(path).await?;

        self.watch_set.note_self_write(path);
        let sidecar_removed = match self.sidecar.remove(path).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Sidecar removal failed");
                false
            }
        };

        let store_removed = self.store.unregister(&content_hash).await?;
        self.watch_set.remove(path);

        tracing::info!(path = %path.display(), hash = %content_hash.short(), "Untagged file");

        Ok(UntagOutcome {
            sidecar_removed,
            store_removed,
        })
    }

    /// Report both tag sources for `path`
    pub async fn query_path(&self, path: &Path) -> Result<PathQuery> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| DlpError::from_io(path, e))?;
        if !metadata.is_file() {
            return Err(DlpError::InvalidInput(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        let sidecar_label = self.sidecar.read(path).await;
        let content_hash = hash_file(path).await?;
        let store_label = self.store.get(&content_hash).await?.map(|file| file.label);

        Ok(PathQuery {
            sidecar_label,
            store_label,
            content_hash: Some(content_hash),
        })
    }

    /// Tag every regular file under `root`
    ///
    /// Symlinks are not followed. Unreadable directories count as one
    /// failure each and the walk continues.
    pub async fn tag_tree_recursive(
        &self,
        root: &Path,
        label: &Label,
        progress: Option<mpsc::UnboundedSender<TagProgress>>,
    ) -> Result<TreeOutcome> {
        let root_meta = tokio::fs::symlink_metadata(root)
            .await
            .map_err(|e| DlpError::from_io(root, e))?;

        let mut outcome = TreeOutcome::default();
        let report = |outcome: &TreeOutcome, path: &Path, error: Option<String>| {
            if let Some(tx) = &progress {
                let _ = tx.send(TagProgress {
                    path: path.to_path_buf(),
                    ok: error.is_none(),
                    succeeded: outcome.succeeded,
                    failed: outcome.failed,
                    error,
                });
            }
        };

        if root_meta.is_file() {
            self.tag_one(root, label, &mut outcome, &report).await;
            return Ok(outcome);
        }

        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    outcome.failed += 1;
                    report(&outcome, &dir, Some(e.to_string()));
                    continue;
                }
            };

            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) => {
                        outcome.failed += 1;
                        report(&outcome, &dir, Some(e.to_string()));
                        break;
                    }
                };

                let path = entry.path();
                match entry.file_type().await {
                    Ok(ft) if ft.is_dir() => pending.push(path),
                    Ok(ft) if ft.is_file() => self.tag_one(&path, label, &mut outcome, &report).await,
                    Ok(_) => {}
                    Err(e) => {
                        outcome.failed += 1;
                        report(&outcome, &path, Some(e.to_string()));
                    }
                }
            }
        }

        tracing::info!(
            root = %root.display(),
            label = %label,
            succeeded = outcome.succeeded,
            failed = outcome.failed,
            "Recursive tagging finished"
        );

        Ok(outcome)
    }

    async fn tag_one<F>(&self, path: &Path, label: &Label, outcome: &mut TreeOutcome, report: &F)
    where
        F: Fn(&TreeOutcome, &Path, Option<String>),
    {
        match self.tag_path(path, label).await {
            Ok(_) => {
                outcome.succeeded += 1;
                report(outcome, path, None);
            }
            Err(e) => {
                outcome.failed += 1;
                report(outcome, path, Some(e.to_string()));
            }
        }
    }
}
