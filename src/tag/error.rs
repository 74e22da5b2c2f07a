//! Tag module error types

use std::path::PathBuf;

use thiserror::Error;

use crate::core::error::DlpError;

/// Result type for sidecar operations
pub type Result<T> = std::result::Result<T, TagError>;

/// Sidecar and tagging errors
#[derive(Error, Debug)]
pub enum TagError {
    #[error("Access denied writing sidecar tag: {path}")]
    AccessDenied { path: PathBuf },

    #[error("File not found: {path}")]
    NotFound { path: PathBuf },

    /// The volume or platform has no attribute mechanism
    #[error("Sidecar tags are not supported for {path}")]
    Unsupported { path: PathBuf },

    #[error("Not a regular file: {path}")]
    NotAFile { path: PathBuf },

    #[error("Sidecar I/O failed on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl TagError {
    /// Classify an I/O error from the attribute mechanism
    pub fn from_io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let path = path.into();
        match err.kind() {
            ErrorKind::NotFound => TagError::NotFound { path },
            ErrorKind::PermissionDenied => TagError::AccessDenied { path },
            ErrorKind::Unsupported => TagError::Unsupported { path },
            _ => TagError::Io { path, source: err },
        }
    }
}

impl From<TagError> for DlpError {
    fn from(err: TagError) -> Self {
        match err {
            // Both degrade to content-hash-only resolution
            TagError::AccessDenied { path } | TagError::Unsupported { path } => {
                DlpError::AccessDenied { path }
            }
            TagError::NotFound { path } | TagError::NotAFile { path } => DlpError::NotFound { path },
            TagError::Io { path, source } => DlpError::from_io(path, source),
        }
    }
}
