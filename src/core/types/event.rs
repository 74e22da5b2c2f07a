//! Audit event types
//!
//! Events are immutable once appended. Field names on the wire match the
//! columns of the `events` table so existing dashboards keep working.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::label::Label;
use super::tagged::ContentHash;

/// Sentinel recorded when the acting identity cannot be determined
pub const UNKNOWN_ACTOR: &str = "unknown";

/// Semantic event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    FileCreated,
    FileModified,
    FileDeleted,
    FileRenamed,
    /// Notification the watcher could not map; still audited
    Unknown,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::FileCreated => "FILE_CREATED",
            EventType::FileModified => "FILE_MODIFIED",
            EventType::FileDeleted => "FILE_DELETED",
            EventType::FileRenamed => "FILE_RENAMED",
            EventType::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "FILE_CREATED" => EventType::FileCreated,
            "FILE_MODIFIED" => EventType::FileModified,
            "FILE_DELETED" => EventType::FileDeleted,
            "FILE_RENAMED" => EventType::FileRenamed,
            _ => EventType::Unknown,
        })
    }
}

/// An event built by the classifier, not yet assigned an id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub file_path: PathBuf,
    pub new_path: Option<PathBuf>,
    pub label: Option<Label>,
    #[serde(rename = "sha256")]
    pub content_hash: Option<ContentHash>,
    #[serde(rename = "user")]
    pub actor_identity: String,
    pub details: Option<String>,
}

impl NewEvent {
    pub fn new(event_type: EventType, file_path: impl Into<PathBuf>) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            file_path: file_path.into(),
            new_path: None,
            label: None,
            content_hash: None,
            actor_identity: UNKNOWN_ACTOR.to_string(),
            details: None,
        }
    }

    pub fn with_new_path(mut self, new_path: impl Into<PathBuf>) -> Self {
        self.new_path = Some(new_path.into());
        self
    }

    pub fn with_label(mut self, label: Option<Label>) -> Self {
        self.label = label;
        self
    }

    pub fn with_hash(mut self, hash: Option<ContentHash>) -> Self {
        self.content_hash = hash;
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor_identity = actor.into();
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Attach the id assigned by the event log
    pub fn into_event(self, id: i64) -> Event {
        Event {
            id,
            timestamp: self.timestamp,
            event_type: self.event_type,
            file_path: self.file_path,
            new_path: self.new_path,
            label: self.label,
            content_hash: self.content_hash,
            actor_identity: self.actor_identity,
            details: self.details,
        }
    }
}

/// A durably recorded audit event
///
/// Ordering by `id` is observed-completion order: classification of
/// different paths runs concurrently, so two events on different paths may
/// be recorded in a different order than the underlying changes happened.
/// Events for the same path are always recorded in notification order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub file_path: PathBuf,
    pub new_path: Option<PathBuf>,
    pub label: Option<Label>,
    #[serde(rename = "sha256")]
    pub content_hash: Option<ContentHash>,
    #[serde(rename = "user")]
    pub actor_identity: String,
    pub details: Option<String>,
}
