//! DLP Monitor - file classification and sensitive-content monitoring
//!
//! Files carry a sensitivity label in two places: a sidecar tag stored with
//! the file (extended attribute or alternate data stream) and a
//! content-addressed index keyed by SHA-256. This crate watches volumes for
//! changes, decides whether each change touches monitored content, carries
//! labels over to copies, and records an audit trail:
//! - Tag store, sidecar accessor and monitored-file resolution
//! - Per-volume watchers with rename correlation
//! - Classification, propagation and a sharded worker pool
//! - Durable event log with live fan-out
//! - Monitoring controller and an HTTP control surface

pub mod api;
pub mod classifier;
pub mod config;
pub mod core;
pub mod db;
pub mod events;
pub mod logging;
pub mod service;
pub mod tag;
pub mod watcher;

// Re-export commonly used items
pub use core::error::{DlpError, Result};
pub use core::types::{ContentHash, Event, EventType, Label};
pub use config::AppConfig;
pub use db::{create_database_pool, DatabaseConfig};
pub use service::{DlpServices, MonitoringController};
