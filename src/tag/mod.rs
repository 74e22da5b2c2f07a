//! Tagging and identity layer
//!
//! This module answers "which files are sensitive":
//! - Content-addressed tag store (SQLite)
//! - Per-file sidecar labels (alternate data stream / extended attribute)
//! - Two-tier resolver combining both
//! - Watch set of paths currently holding monitored content
//! - Tagging operations for operator tools

pub mod error;
pub mod resolver;
pub mod sidecar;
pub mod store;
pub mod tagging;
pub mod watch_set;


pub use error::TagError;
pub use resolver::{MonitoredFileResolver, Resolution};
pub use sidecar::{AsyncSidecar, NativeSidecar, SidecarAccessor};
pub use store::{SqliteTagStore, TagStore};
pub use tagging::{PathQuery, TagOutcome, TagProgress, TaggingService, TreeOutcome, UntagOutcome};
pub use watch_set::{WatchEntry, WatchSet};
