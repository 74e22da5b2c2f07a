//! Watcher error types

use std::path::PathBuf;

use thiserror::Error;

use crate::core::error::{DlpError, ErrorRecovery, RecoveryAction};

/// Volume watcher errors
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Invalid filter pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// The subscription could not be established
    #[error("Failed to watch {volume}: {reason}")]
    Setup { volume: PathBuf, reason: String },

    /// The notification handle was invalidated, e.g. the volume went away
    #[error("Watch on {volume} aborted: {reason}")]
    Aborted { volume: PathBuf, reason: String },

    #[error("Notification read failed on {volume}: {reason}")]
    Stream { volume: PathBuf, reason: String },
}

impl WatchError {
    /// Sort a notify error into transient or fatal for the watched root
    pub fn from_notify(volume: &std::path::Path, err: notify::Error) -> Self {
        use notify::ErrorKind;

        let volume = volume.to_path_buf();
        let reason = err.to_string();
        let root_gone = !volume.exists();
        match err.kind {
            ErrorKind::PathNotFound | ErrorKind::WatchNotFound => WatchError::Aborted { volume, reason },
            _ if root_gone => WatchError::Aborted { volume, reason },
            _ => WatchError::Stream { volume, reason },
        }
    }
}

impl ErrorRecovery for WatchError {
    fn is_retryable(&self) -> bool {
        matches!(self, WatchError::Stream { .. })
    }

    fn recovery_action(&self) -> RecoveryAction {
        match self {
            WatchError::Stream { .. } => RecoveryAction::Retry,
            // The other volumes keep running
            WatchError::Setup { .. } => RecoveryAction::Skip,
            WatchError::Aborted { .. } | WatchError::InvalidPattern { .. } => RecoveryAction::Abort,
        }
    }
}

impl From<WatchError> for DlpError {
    fn from(err: WatchError) -> Self {
        match err {
            WatchError::InvalidPattern { pattern, reason } => {
                DlpError::Config(format!("invalid pattern {:?}: {}", pattern, reason))
            }
            WatchError::Setup { volume, reason } => DlpError::VolumeUnavailable { volume, reason },
            WatchError::Aborted { volume, reason } => DlpError::FatalWatchAbort { volume, reason },
            WatchError::Stream { volume, reason } => DlpError::TransientIo {
                path: volume,
                reason,
            },
        }
    }
}
