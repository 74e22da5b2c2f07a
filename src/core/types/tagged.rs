//! Tagged file types
//!
//! Defines the content-addressed tag record stored in the Tag Store.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::label::Label;

/// SHA-256 digest of a file's full byte stream, lowercase hex
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Wrap an already computed hex digest
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into().to_lowercase())
    }

    /// Wrap raw digest bytes
    pub fn from_digest(bytes: &[u8]) -> Self {
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A logical tagged artifact, keyed by content hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaggedFile {
    /// Primary key; identifies the artifact regardless of copies
    pub content_hash: ContentHash,

    /// Sensitivity label (last write wins)
    pub label: Label,

    /// Last path this content was seen at. Advisory only.
    pub example_path: Option<PathBuf>,

    /// Soft-disable switch; history is kept when false
    pub monitored: bool,

    /// Time of (re)registration
    pub tagged_at: DateTime<Utc>,
}
