//! Error types for the DLP monitor
//!
//! Error taxonomy with recovery support. Every failure the monitoring
//! pipeline can observe maps onto one of these variants, and the
//! [`ErrorRecovery`] trait tells callers whether to retry, degrade or stop.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for DLP monitor operations
pub type Result<T> = std::result::Result<T, DlpError>;

/// Main error type for the DLP monitor
#[derive(Error, Debug)]
pub enum DlpError {
    /// Locked file, momentary notification-read error, vanished mid-read
    #[error("Transient I/O failure on {path}: {reason}")]
    TransientIo { path: PathBuf, reason: String },

    #[error("Access denied: {path}")]
    AccessDenied { path: PathBuf },

    #[error("Path not found: {path}")]
    NotFound { path: PathBuf },

    #[error("Volume unavailable: {volume}: {reason}")]
    VolumeUnavailable { volume: PathBuf, reason: String },

    #[error("Storage failure: {0}")]
    Storage(#[from] StorageError),

    #[error("Watch aborted on {volume}: {reason}")]
    FatalWatchAbort { volume: PathBuf, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Caller supplied something the operation cannot act on
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Persistence errors for the Tag Store and Event Log
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Connection failed: {reason}")]
    ConnectionFailed { reason: String },

    #[error("Query failed: {reason}")]
    QueryFailed { reason: String },

    #[error("Migration failed: {reason}")]
    MigrationFailed { reason: String },

    #[error("Invalid row: {reason}")]
    InvalidRow { reason: String },
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) => StorageError::QueryFailed {
                reason: db_err.to_string(),
            },
            sqlx::Error::PoolTimedOut => StorageError::ConnectionFailed {
                reason: "Pool timed out".to_string(),
            },
            sqlx::Error::PoolClosed => StorageError::ConnectionFailed {
                reason: "Pool closed".to_string(),
            },
            _ => StorageError::QueryFailed {
                reason: err.to_string(),
            },
        }
    }
}

impl DlpError {
    /// Classify an I/O error raised while touching `path`
    pub fn from_io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let path = path.into();
        match err.kind() {
            ErrorKind::NotFound => DlpError::NotFound { path },
            ErrorKind::PermissionDenied => DlpError::AccessDenied { path },
            _ => DlpError::TransientIo {
                path,
                reason: err.to_string(),
            },
        }
    }
}

/// Trait for error recovery strategies
pub trait ErrorRecovery {
    /// Check if the error is retryable
    fn is_retryable(&self) -> bool;

    /// Get recovery action suggestion
    fn recovery_action(&self) -> RecoveryAction;
}

/// Recovery action suggestions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Retry the operation after a backoff
    Retry,
    /// Skip this item and continue
    Skip,
    /// Keep running with reduced guarantees (content-hash only, audit gap)
    Degrade,
    /// Stop the affected component
    Abort,
}

impl ErrorRecovery for DlpError {
    fn is_retryable(&self) -> bool {
        match self {
            DlpError::TransientIo { .. } => true,
            DlpError::Storage(e) => e.is_retryable(),
            DlpError::Database(_) => true,
            DlpError::Io(_) => true,
            _ => false,
        }
    }

    fn recovery_action(&self) -> RecoveryAction {
        match self {
            DlpError::TransientIo { .. } => RecoveryAction::Retry,
            DlpError::AccessDenied { .. } => RecoveryAction::Degrade,
            DlpError::NotFound { .. } => RecoveryAction::Skip,
            DlpError::VolumeUnavailable { .. } => RecoveryAction::Skip,
            DlpError::Storage(e) => e.recovery_action(),
            DlpError::Database(_) => RecoveryAction::Retry,
            DlpError::FatalWatchAbort { .. } => RecoveryAction::Abort,
            DlpError::Config(_) => RecoveryAction::Abort,
            DlpError::InvalidInput(_) => RecoveryAction::Skip,
            DlpError::Io(_) => RecoveryAction::Retry,
            DlpError::Internal(_) => RecoveryAction::Abort,
        }
    }
}

impl ErrorRecovery for StorageError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageError::ConnectionFailed { .. } | StorageError::QueryFailed { .. }
        )
    }

    fn recovery_action(&self) -> RecoveryAction {
        match self {
            StorageError::MigrationFailed { .. } => RecoveryAction::Abort,
            StorageError::InvalidRow { .. } => RecoveryAction::Skip,
            _ => RecoveryAction::Degrade,
        }
    }
}
