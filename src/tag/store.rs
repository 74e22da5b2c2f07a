//! Tag Store - content hash to label index
//!
//! Persistent mapping keyed by SHA-256 of file content. Registrations for
//! the same hash are serialized; registrations for different hashes run
//! independently and SQLite WAL lets lookups proceed during a write.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use sqlx::SqlitePool;
use tokio::sync::Mutex;

use crate::core::error::{DlpError, Result, StorageError};
use crate::core::types::{ContentHash, Label, TaggedFile};
use crate::core::utils::parse_timestamp;
use crate::db::migration::MigrationManager;
use crate::db::{create_database_pool, DatabaseConfig};

/// Content-addressed label index
#[async_trait]
pub trait TagStore: Send + Sync {
    /// Insert or replace the row for `hash` (last write wins, no merge)
    async fn register(&self, hash: &ContentHash, label: &Label, path: &Path) -> Result<()>;

    /// Delete the row for `hash`. Returns whether a row existed.
    async fn unregister(&self, hash: &ContentHash) -> Result<bool>;

    /// Label of a monitored row
    async fn lookup(&self, hash: &ContentHash) -> Result<Option<Label>>;

    /// Full row, monitored or not
    async fn get(&self, hash: &ContentHash) -> Result<Option<TaggedFile>>;

    async fn list_monitored(&self) -> Result<Vec<TaggedFile>>;

    /// Soft-disable or re-enable a row. Returns whether a row existed.
    async fn set_monitored(&self, hash: &ContentHash, monitored: bool) -> Result<bool>;

    /// Record a newer path for known content. Identity and label are untouched.
    async fn update_example_path(&self, hash: &ContentHash, path: &Path) -> Result<bool>;

    async fn count_monitored(&self) -> Result<u64>;
}

/// SQLite-backed tag store
pub struct SqliteTagStore {
    pool: SqlitePool,
    /// One registration in flight per hash
    hash_locks: DashMap<ContentHash, Arc<Mutex<()>>>,
}

impl SqliteTagStore {
    /// Open (or create) the store and apply its schema
    pub async fn open(config: &DatabaseConfig) -> Result<Self> {
        let pool = create_database_pool(config).await?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, applying pending migrations
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        MigrationManager::for_tag_store(pool.clone()).migrate().await?;
        Ok(Self {
            pool,
            hash_locks: DashMap::new(),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn lock_for(&self, hash: &ContentHash) -> Arc<Mutex<()>> {
        self.hash_locks
            .entry(hash.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

fn storage(err: sqlx::Error) -> DlpError {
    DlpError::Storage(StorageError::from(err))
}

#[async_trait]
impl TagStore for SqliteTagStore {
    async fn register(&self, hash: &ContentHash, label: &Label, path: &Path) -> Result<()> {
        let lock = self.lock_for(hash);
        let _guard = lock.lock().await;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO files (sha256, label, example_path, monitored, tagged_date)
            VALUES (?, ?, ?, 1, ?)
            "#,
        )
        .bind(hash.as_str())
        .bind(label.as_str())
        .bind(path.to_string_lossy().as_ref())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        tracing::debug!(hash = %hash.short(), label = %label, path = %path.display(), "Registered content");
        Ok(())
    }

    async fn unregister(&self, hash: &ContentHash) -> Result<bool> {
        let lock = self.lock_for(hash);
        let result = {
            let _guard = lock.lock().await;
            sqlx::query("DELETE FROM files WHERE sha256 = ?")
                .bind(hash.as_str())
                .execute(&self.pool)
                .await
                .map_err(storage)?
        };
        self.hash_locks.remove(hash);

        Ok(result.rows_affected() > 0)
    }

    async fn lookup(&self, hash: &ContentHash) -> Result<Option<Label>> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT label FROM files WHERE sha256 = ? AND monitored = 1")
                .bind(hash.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(storage)?;

        row.and_then(|(label,)| label)
            .map(|label| label.parse())
            .transpose()
    }

    async fn get(&self, hash: &ContentHash) -> Result<Option<TaggedFile>> {
        let row = sqlx::query_as::<_, FileRow>(
            "SELECT sha256, label, example_path, monitored, tagged_date FROM files WHERE sha256 = ?",
        )
        .bind(hash.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        row.map(FileRow::into_tagged_file).transpose()
    }

    async fn list_monitored(&self) -> Result<Vec<TaggedFile>> {
        let rows = sqlx::query_as::<_, FileRow>(
            "SELECT sha256, label, example_path, monitored, tagged_date FROM files WHERE monitored = 1 ORDER BY tagged_date",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        // Rows written by older tools may lack a label; skip rather than fail the listing
        Ok(rows
            .into_iter()
            .filter_map(|row| match row.into_tagged_file() {
                Ok(file) => Some(file),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unreadable tag row");
                    None
                }
            })
            .collect())
    }

    async fn set_monitored(&self, hash: &ContentHash, monitored: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE files SET monitored = ? WHERE sha256 = ?")
            .bind(monitored)
            .bind(hash.as_str())
            .execute(&self.pool)
            .await
            .map_err(storage)?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_example_path(&self, hash: &ContentHash, path: &Path) -> Result<bool> {
        let result = sqlx::query("UPDATE files SET example_path = ? WHERE sha256 = ?")
            .bind(path.to_string_lossy().as_ref())
            .bind(hash.as_str())
            .execute(&self.pool)
            .await
            .map_err(storage)?;

        Ok(result.rows_affected() > 0)
    }

    async fn count_monitored(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM files WHERE monitored = 1")
            .fetch_one(&self.pool)
            .await
            .map_err(storage)?;

        Ok(count.max(0) as u64)
    }
}

/// Raw `files` row
#[derive(sqlx::FromRow)]
struct FileRow {
    sha256: String,
    label: Option<String>,
    example_path: Option<String>,
    monitored: Option<bool>,
    tagged_date: Option<String>,
}

impl FileRow {
    fn into_tagged_file(self) -> Result<TaggedFile> {
        let label = self
            .label
            .ok_or_else(|| {
                DlpError::Storage(StorageError::InvalidRow {
                    reason: format!("row {} has no label", self.sha256),
                })
            })?
            .parse()?;

        Ok(TaggedFile {
            content_hash: ContentHash::from_hex(self.sha256),
            label,
            example_path: self.example_path.filter(|p| !p.is_empty()).map(Into::into),
            monitored: self.monitored.unwrap_or(true),
            tagged_at: self
                .tagged_date
                .as_deref()
                .and_then(parse_timestamp)
                .unwrap_or_default(),
        })
    }
}
