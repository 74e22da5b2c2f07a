//! Durable, append-only event log

use std::path::PathBuf;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tokio::sync::Mutex;

use crate::core::types::{ContentHash, Event, EventType, NewEvent};
use crate::core::utils::parse_timestamp;
use crate::db::migration::MigrationManager;
use crate::db::{create_database_pool, DatabaseConfig};

use super::error::Result;

/// Append-only audit trail
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Persist an event and return it with its assigned id
    async fn append(&self, event: &NewEvent) -> Result<Event>;

    /// Latest events, most recent first
    async fn recent(&self, limit: usize) -> Result<Vec<Event>>;
}

/// SQLite-backed event log
///
/// Appends go through a single writer so ids follow completion order.
pub struct SqliteEventLog {
    pool: SqlitePool,
    writer: Mutex<()>,
}

impl SqliteEventLog {
    pub async fn open(config: &DatabaseConfig) -> std::result::Result<Self, crate::core::DlpError> {
        let pool = create_database_pool(config).await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> std::result::Result<Self, crate::core::DlpError> {
        MigrationManager::for_event_log(pool.clone()).migrate().await?;
        Ok(Self {
            pool,
            writer: Mutex::new(()),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl EventLog for SqliteEventLog {
    async fn append(&self, event: &NewEvent) -> Result<Event> {
        let _writer = self.writer.lock().await;

        let result = sqlx::query(
            r#"
            INSERT INTO events (timestamp, event_type, file_path, new_path, label, sha256, user, details)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.timestamp.to_rfc3339())
        .bind(event.event_type.as_str())
        .bind(event.file_path.to_string_lossy().as_ref())
        .bind(event.new_path.as_ref().map(|p| p.to_string_lossy().into_owned()))
        .bind(event.label.as_ref().map(|l| l.as_str().to_string()))
        .bind(event.content_hash.as_ref().map(|h| h.as_str().to_string()))
        .bind(&event.actor_identity)
        .bind(&event.details)
        .execute(&self.pool)
        .await?;

        Ok(event.clone().into_event(result.last_insert_rowid()))
    }

    async fn recent(&self, limit: usize) -> Result<Vec<Event>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT id, timestamp, event_type, file_path, new_path, label, sha256, user, details
            FROM events ORDER BY id DESC LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(EventRow::into_event).collect())
    }
}

/// Raw `events` row
#[derive(sqlx::FromRow)]
struct EventRow {
    id: i64,
    timestamp: Option<String>,
    event_type: Option<String>,
    file_path: Option<String>,
    new_path: Option<String>,
    label: Option<String>,
    sha256: Option<String>,
    user: Option<String>,
    details: Option<String>,
}

impl EventRow {
    /// Rows are never rejected; the log may hold rows from older writers
    fn into_event(self) -> Event {
        Event {
            id: self.id,
            timestamp: self
                .timestamp
                .as_deref()
                .and_then(parse_timestamp)
                .unwrap_or_default(),
            event_type: self
                .event_type
                .as_deref()
                .map(|t| t.parse().unwrap_or(EventType::Unknown))
                .unwrap_or(EventType::Unknown),
            file_path: PathBuf::from(self.file_path.unwrap_or_default()),
            new_path: self.new_path.filter(|p| !p.is_empty()).map(PathBuf::from),
            label: self.label.and_then(|l| l.parse().ok()),
            content_hash: self.sha256.filter(|h| !h.is_empty()).map(ContentHash::from_hex),
            actor_identity: self
                .user
                .unwrap_or_else(|| crate::core::types::UNKNOWN_ACTOR.to_string()),
            details: self.details,
        }
    }
}


/// In-memory log for tests
///
/// `fail_next` makes the following appends fail with a retryable error;
/// `delay` slows every append down.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct MemoryEventLog {
    events: parking_lot::Mutex<Vec<Event>>,
    pub(crate) fail_next: std::sync::atomic::AtomicUsize,
    pub(crate) delay: parking_lot::Mutex<Option<std::time::Duration>>,
    pub(crate) attempts: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl MemoryEventLog {
    pub(crate) fn failing(times: usize) -> Self {
        let log = Self::default();
        log.fail_next
            .store(times, std::sync::atomic::Ordering::SeqCst);
        log
    }

    pub(crate) fn slowed(delay: std::time::Duration) -> Self {
        let log = Self::default();
        *log.delay.lock() = Some(delay);
        log
    }

    pub(crate) fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
#[async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, event: &NewEvent) -> Result<Event> {
        use std::sync::atomic::Ordering;

        self.attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(crate::core::StorageError::ConnectionFailed {
                reason: "database is locked".to_string(),
            }
            .into());
        }
        let mut events = self.events.lock();
        let logged = event.clone().into_event(events.len() as i64 + 1);
        events.push(logged.clone());
        Ok(logged)
    }

    async fn recent(&self, limit: usize) -> Result<Vec<Event>> {
        Ok(self.events.lock().iter().rev().take(limit).cloned().collect())
    }
}
