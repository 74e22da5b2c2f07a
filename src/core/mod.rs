//! DLP Monitor Core Module
//!
//! This module contains the shared foundations:
//! - Error types and recovery hints
//! - Domain types (labels, tagged files, audit events)
//! - Hashing and path utilities

pub mod error;
pub mod types;
pub mod utils;

// Re-export commonly used items
pub use error::{DlpError, ErrorRecovery, RecoveryAction, Result, StorageError};
pub use types::{ContentHash, Event, EventType, Label, NewEvent, TaggedFile, UNKNOWN_ACTOR};
