//! Monitored-File Resolver
//!
//! Two-tier answer to "is this file sensitive, and with which label":
//!
//! 1. The sidecar is read first. A present sidecar marks the file monitored
//!    on its own, and the content hash is still taken when the file is small
//!    enough for that to be cheap.
//! 2. Without a sidecar the file is hashed and the content index decides.
//!
//! When both tiers answer and disagree, the content index wins. A file that
//! cannot be hashed (locked, vanished, still zero bytes) resolves as not
//! monitored with no hash; resolution never returns an error.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;

use crate::core::types::{ContentHash, Label};
use crate::core::utils::hash_file;

use super::sidecar::{AsyncSidecar, SidecarAccessor};
use super::store::TagStore;

/// Files above this size are not hashed when a sidecar already answered
pub const OPPORTUNISTIC_HASH_LIMIT: u64 = 64 * 1024 * 1024;

/// Result of resolving a path
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub monitored: bool,
    /// Effective label
    pub label: Option<Label>,
    pub content_hash: Option<ContentHash>,
    pub sidecar_label: Option<Label>,
    /// Label held by the content index for `content_hash`
    pub indexed_label: Option<Label>,
}

impl Resolution {
    /// Not monitored, nothing known
    pub fn unmonitored() -> Self {
        Self::default()
    }

    /// The sidecar is missing or disagrees with the content index
    pub fn sidecar_stale(&self) -> bool {
        match &self.indexed_label {
            Some(indexed) => self.sidecar_label.as_ref() != Some(indexed),
            None => false,
        }
    }
}

/// Combines the sidecar accessor and the tag store
#[derive(Clone)]
pub struct MonitoredFileResolver {
    store: Arc<dyn TagStore>,
    sidecar: AsyncSidecar,
}

impl MonitoredFileResolver {
    pub fn new(store: Arc<dyn TagStore>, sidecar: Arc<dyn SidecarAccessor>) -> Self {
        Self {
            store,
            sidecar: AsyncSidecar::new(sidecar),
        }
    }

    pub fn store(&self) -> &Arc<dyn TagStore> {
        &self.store
    }

    pub fn sidecar(&self) -> &AsyncSidecar {
        &self.sidecar
    }

    pub async fn resolve(&self, path: &Path) -> Resolution {
        let sidecar_label = self.sidecar.read(path).await;

        let content_hash = match &sidecar_label {
            Some(_) => self.hash_if_cheap(path).await,
            None => self.hash(path).await,
        };

        let indexed_label = match &content_hash {
            Some(hash) => match self.store.lookup(hash).await {
                Ok(label) => label,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Tag store lookup failed");
                    None
                }
            },
            None => None,
        };

        let label = indexed_label.clone().or_else(|| sidecar_label.clone());
        Resolution {
            monitored: label.is_some(),
            label,
            content_hash,
            sidecar_label,
            indexed_label,
        }
    }

    /// Hash of a non-empty regular file, `None` on any failure
    async fn hash(&self, path: &Path) -> Option<ContentHash> {
        match tokio::fs::metadata(path).await {
            Ok(metadata) if metadata.is_file() && metadata.len() > 0 => {}
            Ok(_) => return None,
            Err(e) => {
                tracing::trace!(path = %path.display(), error = %e, "Cannot stat for hashing");
                return None;
            }
        }

        match hash_file(path).await {
            Ok(hash) => Some(hash),
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "Hashing failed");
                None
            }
        }
    }

    async fn hash_if_cheap(&self, path: &Path) -> Option<ContentHash> {
        match tokio::fs::metadata(path).await {
            Ok(metadata) if metadata.len() <= OPPORTUNISTIC_HASH_LIMIT => self.hash(path).await,
            _ => None,
        }
    }
}
