//! Schema migration manager
//!
//! Applies embedded SQL migrations atomically and verifies checksums of
//! migrations that were already applied.

use std::collections::HashMap;

use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;

use crate::core::error::{DlpError, Result, StorageError};

/// Represents a single database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Migration version number
    pub version: i64,
    /// Migration name
    pub name: String,
    /// SQL statements to apply the migration
    pub up_sql: String,
    /// Checksum for integrity verification
    pub checksum: String,
}

impl Migration {
    /// Create a new migration
    pub fn new(version: i64, name: impl Into<String>, up_sql: impl Into<String>) -> Self {
        let up_sql = up_sql.into();
        let checksum = hex::encode(Sha256::digest(up_sql.as_bytes()));
        Self {
            version,
            name: name.into(),
            up_sql,
            checksum,
        }
    }

    /// Executable statements, with comment lines removed
    fn statements(&self) -> impl Iterator<Item = String> + '_ {
        self.up_sql.split(';').filter_map(|chunk| {
            let statement = chunk
                .lines()
                .filter(|line| !line.trim_start().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");
            let statement = statement.trim();
            (!statement.is_empty()).then(|| statement.to_string())
        })
    }
}

/// Migration manager for handling database schema updates
pub struct MigrationManager {
    pool: SqlitePool,
    migrations: Vec<Migration>,
}

impl MigrationManager {
    /// Create a new migration manager
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            migrations: Vec::new(),
        }
    }

    /// Add a migration to the manager
    pub fn add_migration(&mut self, migration: Migration) {
        self.migrations.push(migration);
        self.migrations.sort_by_key(|m| m.version);
    }

    /// Schema of the content-addressed tag index
    pub fn for_tag_store(pool: SqlitePool) -> Self {
        let mut manager = Self::new(pool);
        manager.add_migration(Migration::new(
            1,
            "001_files",
            include_str!("../../migrations/tags/001_files.sql"),
        ));
        manager
    }

    /// Schema of the append-only event log
    pub fn for_event_log(pool: SqlitePool) -> Self {
        let mut manager = Self::new(pool);
        manager.add_migration(Migration::new(
            1,
            "001_events",
            include_str!("../../migrations/events/001_events.sql"),
        ));
        manager
    }

    async fn ensure_migrations_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY NOT NULL,
                name TEXT NOT NULL,
                applied_at TEXT NOT NULL,
                checksum TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| DlpError::Storage(StorageError::from(e)))?;

        Ok(())
    }

    /// Get the current schema version
    pub async fn current_version(&self) -> Result<i64> {
        self.ensure_migrations_table().await?;

        let result: (Option<i64>,) = sqlx::query_as("SELECT MAX(version) FROM schema_migrations")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| DlpError::Storage(StorageError::from(e)))?;

        Ok(result.0.unwrap_or(0))
    }

    async fn applied_checksums(&self) -> Result<HashMap<i64, String>> {
        let rows: Vec<(i64, String)> =
            sqlx::query_as("SELECT version, checksum FROM schema_migrations ORDER BY version")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| DlpError::Storage(StorageError::from(e)))?;

        Ok(rows.into_iter().collect())
    }

    /// Run all pending migrations
    ///
    /// Each migration runs in its own transaction; a failing statement rolls
    /// the whole migration back.
    pub async fn migrate(&self) -> Result<MigrationResult> {
        self.ensure_migrations_table().await?;

        let applied = self.applied_checksums().await?;
        let mut result = MigrationResult::default();

        for migration in &self.migrations {
            if let Some(checksum) = applied.get(&migration.version) {
                if *checksum != migration.checksum {
                    return Err(DlpError::Storage(StorageError::MigrationFailed {
                        reason: format!(
                            "Migration {} checksum mismatch: expected {}, found {}",
                            migration.version, migration.checksum, checksum
                        ),
                    }));
                }
                result.skipped += 1;
                continue;
            }

            self.apply_migration(migration).await?;
            result.applied += 1;
            result.applied_versions.push(migration.version);
        }

        result.current_version = self.current_version().await?;
        Ok(result)
    }

    async fn apply_migration(&self, migration: &Migration) -> Result<()> {
        tracing::info!(version = migration.version, name = %migration.name, "Applying migration");

        let migration_failed = |reason: String| DlpError::Storage(StorageError::MigrationFailed { reason });

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| migration_failed(e.to_string()))?;

        for statement in migration.statements() {
            sqlx::query(&statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    migration_failed(format!(
                        "Migration {} failed at statement: {}. Error: {}",
                        migration.version, statement, e
                    ))
                })?;
        }

        sqlx::query(
            "INSERT INTO schema_migrations (version, name, applied_at, checksum) VALUES (?, ?, ?, ?)",
        )
        .bind(migration.version)
        .bind(&migration.name)
        .bind(Utc::now().to_rfc3339())
        .bind(&migration.checksum)
        .execute(&mut *tx)
        .await
        .map_err(|e| migration_failed(e.to_string()))?;

        tx.commit().await.map_err(|e| migration_failed(e.to_string()))?;

        Ok(())
    }
}

/// Result of running migrations
#[derive(Debug, Default)]
pub struct MigrationResult {
    /// Number of migrations applied
    pub applied: usize,
    /// Number of migrations skipped (already applied)
    pub skipped: usize,
    /// Versions that were applied
    pub applied_versions: Vec<i64>,
    /// Current schema version after migration
    pub current_version: i64,
}
