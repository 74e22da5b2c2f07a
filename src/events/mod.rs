//! Audit event pipeline
//!
//! This module owns what happens after an event is classified:
//! - Durable append-only log (SQLite)
//! - Live fan-out to subscribers
//! - Bounded-retry recorder with degraded-mode warnings

pub mod error;
pub mod log;
pub mod publisher;
pub mod recorder;

#[cfg(test)]
mod tests;

pub use error::EventLogError;
pub use log::{EventLog, SqliteEventLog};
pub use publisher::{EventPublisher, EventSubscription, DEFAULT_PUBLISH_CAPACITY};
pub use recorder::{AuditRecorder, DegradedWarning, RecorderConfig, Recorded};
