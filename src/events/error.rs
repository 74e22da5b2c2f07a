//! Event log error types

use thiserror::Error;

use crate::core::error::{DlpError, ErrorRecovery, StorageError};

/// Result type for event log operations
pub type Result<T> = std::result::Result<T, EventLogError>;

#[derive(Error, Debug)]
pub enum EventLogError {
    #[error("Event log storage failure: {0}")]
    Storage(#[from] StorageError),

    /// Bounded retries used up; the event was not persisted
    #[error("Event not persisted after {attempts} attempts: {reason}")]
    Exhausted { attempts: u32, reason: String },
}

impl From<sqlx::Error> for EventLogError {
    fn from(err: sqlx::Error) -> Self {
        EventLogError::Storage(StorageError::from(err))
    }
}

impl EventLogError {
    pub fn is_retryable(&self) -> bool {
        match self {
            EventLogError::Storage(e) => e.is_retryable(),
            EventLogError::Exhausted { .. } => false,
        }
    }
}

impl From<EventLogError> for DlpError {
    fn from(err: EventLogError) -> Self {
        match err {
            EventLogError::Storage(e) => DlpError::Storage(e),
            EventLogError::Exhausted { reason, .. } => {
                DlpError::Storage(StorageError::QueryFailed { reason })
            }
        }
    }
}
