//! Database module for the DLP monitor
//!
//! SQLite connectivity for the two independent stores (tag index and event
//! log). WAL mode lets readers run while a single writer appends.

pub mod migration;

#[cfg(test)]
mod tests;

use std::path::PathBuf;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;

use crate::core::error::{DlpError, Result, StorageError};

/// SQLite synchronous mode configuration
#[derive(Debug, Clone, Copy, Default)]
pub enum SynchronousMode {
    /// Fastest, but may lose data on crash
    Off,
    /// Balanced performance and safety
    #[default]
    Normal,
    /// Safest, but slowest
    Full,
}

/// SQLite connection pool configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Database file path
    pub db_path: PathBuf,

    /// Maximum number of connections
    pub max_connections: u32,

    /// Minimum number of connections
    pub min_connections: u32,

    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,

    /// Whether to enable WAL mode
    pub enable_wal: bool,

    /// Synchronous mode
    pub synchronous: SynchronousMode,

    /// Busy timeout in milliseconds
    pub busy_timeout_ms: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("dlp.db"),
            max_connections: 8,
            min_connections: 1,
            connect_timeout_secs: 30,
            enable_wal: true,
            synchronous: SynchronousMode::Normal,
            busy_timeout_ms: 5000,
        }
    }
}

impl DatabaseConfig {
    /// Create a new DatabaseConfig with the specified path
    pub fn with_path(db_path: PathBuf) -> Self {
        Self {
            db_path,
            ..Default::default()
        }
    }

    /// Set WAL mode
    pub fn with_wal(mut self, enable: bool) -> Self {
        self.enable_wal = enable;
        self
    }

    /// Set maximum connections
    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Set synchronous mode
    pub fn with_synchronous(mut self, mode: SynchronousMode) -> Self {
        self.synchronous = mode;
        self
    }
}

/// Create a database connection pool with the given configuration
///
/// # Errors
///
/// Returns `StorageError::ConnectionFailed` if the directory cannot be
/// created or the database cannot be opened.
pub async fn create_database_pool(config: &DatabaseConfig) -> Result<SqlitePool> {
    if let Some(parent) = config.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                DlpError::Storage(StorageError::ConnectionFailed {
                    reason: format!("Failed to create database directory {:?}: {}", parent, e),
                })
            })?;
        }
    }

    let connect_options = SqliteConnectOptions::new()
        .filename(&config.db_path)
        .create_if_missing(true)
        .journal_mode(if config.enable_wal {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Delete
        })
        .synchronous(match config.synchronous {
            SynchronousMode::Off => SqliteSynchronous::Off,
            SynchronousMode::Normal => SqliteSynchronous::Normal,
            SynchronousMode::Full => SqliteSynchronous::Full,
        })
        .busy_timeout(Duration::from_millis(config.busy_timeout_ms as u64));

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .connect_with(connect_options)
        .await
        .map_err(|e| DlpError::Storage(StorageError::from(e)))?;

    tracing::info!(
        db_path = ?config.db_path,
        wal = config.enable_wal,
        connections = config.max_connections,
        "Database pool created"
    );

    Ok(pool)
}
