//! Utility functions for the DLP monitor
//!
//! Content hashing, path normalisation and actor lookup.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use sha2::{Digest, Sha256};

use crate::core::error::{DlpError, Result};
use crate::core::types::{ContentHash, UNKNOWN_ACTOR};

/// Read block size for streaming digests (4 MiB, same as the tagging tools)
pub const HASH_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Compute the SHA-256 digest of a byte slice
pub fn hash_bytes(content: &[u8]) -> ContentHash {
    ContentHash::from_digest(&Sha256::digest(content))
}

/// Stream a file through SHA-256 (blocking)
///
/// Every byte contributes to the digest in order, so two files hash equal
/// exactly when their contents are identical.
pub fn hash_file_blocking(path: &Path) -> Result<ContentHash> {
    let mut file = File::open(path).map_err(|e| DlpError::from_io(path, e))?;
    let metadata = file.metadata().map_err(|e| DlpError::from_io(path, e))?;
    if !metadata.is_file() {
        return Err(DlpError::NotFound {
            path: path.to_path_buf(),
        });
    }

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BLOCK_SIZE.min(metadata.len().max(1) as usize)];
    loop {
        let read = file
            .read(&mut buffer)
            .map_err(|e| DlpError::from_io(path, e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(ContentHash::from_digest(&hasher.finalize()))
}

/// Stream a file through SHA-256 on the blocking pool
pub async fn hash_file(path: &Path) -> Result<ContentHash> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || hash_file_blocking(&owned))
        .await
        .map_err(|e| DlpError::Internal(format!("hash task failed: {}", e)))?
}

/// Normalize path to an absolute form
pub fn normalize_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

/// Parse a stored timestamp
///
/// Accepts RFC 3339 and the offset-less ISO form written by the desktop
/// tagging tools (read as UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Identity of the interactive session the agent runs under
///
/// File-system notifications carry no actor, so this is the best available
/// attribution; `UNKNOWN_ACTOR` when the environment gives nothing.
pub fn session_actor() -> String {
    ["USER", "USERNAME", "LOGNAME"]
        .iter()
        .filter_map(|key| std::env::var(key).ok())
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
        .unwrap_or_else(|| UNKNOWN_ACTOR.to_string())
}
