//! Sidecar Tag Accessor
//!
//! A label stored with the file object itself rather than in the index:
//! an NTFS alternate data stream on Windows, a `user.` extended attribute
//! on Linux. Neither mechanism touches the primary data stream, so the
//! content hash is unaffected by tagging.
//!
//! Sidecars do not survive every copy channel. They are a hint; the
//! content index stays authoritative.

use std::path::Path;
use std::sync::Arc;

use crate::core::types::Label;

use super::error::{Result, TagError};

/// Reads and writes the per-file label
pub trait SidecarAccessor: Send + Sync {
    /// Attach `label` to the file at `path`, replacing any previous one
    fn write(&self, path: &Path, label: &Label) -> Result<()>;

    /// Label attached to `path`, if any. Every failure reads as absent.
    fn read(&self, path: &Path) -> Option<Label>;

    /// Detach the label. Removing an absent label succeeds.
    fn remove(&self, path: &Path) -> Result<()>;
}

/// Runs sidecar calls on the blocking pool
///
/// Attribute syscalls can stall on network and removable volumes.
#[derive(Clone)]
pub struct AsyncSidecar {
    inner: Arc<dyn SidecarAccessor>,
}

impl AsyncSidecar {
    pub fn new(inner: Arc<dyn SidecarAccessor>) -> Self {
        Self { inner }
    }

    pub async fn write(&self, path: &Path, label: &Label) -> Result<()> {
        let inner = self.inner.clone();
        let owned = path.to_path_buf();
        let label = label.clone();
        tokio::task::spawn_blocking(move || inner.write(&owned, &label))
            .await
            .map_err(|e| join_error(path, e))?
    }

    pub async fn read(&self, path: &Path) -> Option<Label> {
        let inner = self.inner.clone();
        let owned = path.to_path_buf();
        match tokio::task::spawn_blocking(move || inner.read(&owned)).await {
            Ok(label) => label,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Sidecar read task failed");
                None
            }
        }
    }

    pub async fn remove(&self, path: &Path) -> Result<()> {
        let inner = self.inner.clone();
        let owned = path.to_path_buf();
        tokio::task::spawn_blocking(move || inner.remove(&owned))
            .await
            .map_err(|e| join_error(path, e))?
    }
}

fn join_error(path: &Path, err: tokio::task::JoinError) -> TagError {
    TagError::Io {
        path: path.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::Other, err),
    }
}

/// Sidecar backed by the platform attribute mechanism
#[derive(Debug, Clone)]
pub struct NativeSidecar {
    name: String,
}

impl NativeSidecar {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn ensure_file(path: &Path) -> Result<()> {
        let metadata = std::fs::metadata(path).map_err(|e| TagError::from_io(path, e))?;
        if metadata.is_file() {
            Ok(())
        } else {
            Err(TagError::NotAFile {
                path: path.to_path_buf(),
            })
        }
    }
}

impl Default for NativeSidecar {
    fn default() -> Self {
        Self::new("dlp")
    }
}

impl SidecarAccessor for NativeSidecar {
    fn write(&self, path: &Path, label: &Label) -> Result<()> {
        Self::ensure_file(path)?;
        platform::write(path, &self.name, label.as_str().as_bytes())
            .map_err(|e| TagError::from_io(path, e))
    }

    fn read(&self, path: &Path) -> Option<Label> {
        let raw = match platform::read(path, &self.name) {
            Ok(raw) => raw?,
            Err(e) => {
                tracing::trace!(path = %path.display(), error = %e, "Sidecar unreadable");
                return None;
            }
        };

        let text = String::from_utf8_lossy(&raw);
        let text = text.trim_matches(|c: char| c.is_whitespace() || c == '\0');
        if text.is_empty() {
            return None;
        }
        match text.parse() {
            Ok(label) => Some(label),
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "Ignoring malformed sidecar");
                None
            }
        }
    }

    fn remove(&self, path: &Path) -> Result<()> {
        Self::ensure_file(path)?;
        platform::remove(path, &self.name).map_err(|e| TagError::from_io(path, e))
    }
}

#[cfg(target_os = "linux")]
mod platform {
    use std::ffi::CString;
    use std::io;
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    fn c_path(path: &Path) -> io::Result<CString> {
        CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))
    }

    fn c_name(name: &str) -> io::Result<CString> {
        CString::new(format!("user.{}", name))
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "attribute name contains NUL"))
    }

    fn last_error() -> io::Error {
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(code) if code == libc::ENOTSUP || code == libc::EOPNOTSUPP => {
                io::Error::new(io::ErrorKind::Unsupported, err)
            }
            _ => err,
        }
    }

    fn is_absent(err: &io::Error) -> bool {
        err.raw_os_error() == Some(libc::ENODATA)
    }

    pub fn write(path: &Path, name: &str, value: &[u8]) -> io::Result<()> {
        let path = c_path(path)?;
        let name = c_name(name)?;
        // SAFETY: both strings are NUL-terminated and outlive the call; value is a valid slice
        let rc = unsafe {
            libc::setxattr(
                path.as_ptr(),
                name.as_ptr(),
                value.as_ptr() as *const libc::c_void,
                value.len(),
                0,
            )
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(last_error())
        }
    }

    pub fn read(path: &Path, name: &str) -> io::Result<Option<Vec<u8>>> {
        let path = c_path(path)?;
        let name = c_name(name)?;

        // SAFETY: a null buffer with size 0 asks only for the value length
        let size = unsafe { libc::getxattr(path.as_ptr(), name.as_ptr(), std::ptr::null_mut(), 0) };
        if size < 0 {
            let err = last_error();
            return if is_absent(&err) { Ok(None) } else { Err(err) };
        }

        let mut buffer = vec![0u8; size as usize];
        // SAFETY: buffer is writable for buffer.len() bytes
        let read = unsafe {
            libc::getxattr(
                path.as_ptr(),
                name.as_ptr(),
                buffer.as_mut_ptr() as *mut libc::c_void,
                buffer.len(),
            )
        };
        if read < 0 {
            let err = last_error();
            return if is_absent(&err) { Ok(None) } else { Err(err) };
        }

        buffer.truncate(read as usize);
        Ok(Some(buffer))
    }

    pub fn remove(path: &Path, name: &str) -> io::Result<()> {
        let path = c_path(path)?;
        let name = c_name(name)?;
        // SAFETY: both strings are NUL-terminated and outlive the call
        let rc = unsafe { libc::removexattr(path.as_ptr(), name.as_ptr()) };
        if rc == 0 {
            return Ok(());
        }
        let err = last_error();
        if is_absent(&err) {
            Ok(())
        } else {
            Err(err)
        }
    }
}

#[cfg(windows)]
mod platform {
    use std::io::{self, Read, Write};
    use std::path::{Path, PathBuf};

    fn stream_path(path: &Path, name: &str) -> PathBuf {
        let mut stream = path.as_os_str().to_os_string();
        stream.push(":");
        stream.push(name);
        PathBuf::from(stream)
    }

    pub fn write(path: &Path, name: &str, value: &[u8]) -> io::Result<()> {
        let mut file = std::fs::File::create(stream_path(path, name))?;
        file.write_all(value)?;
        file.flush()
    }

    pub fn read(path: &Path, name: &str) -> io::Result<Option<Vec<u8>>> {
        match std::fs::File::open(stream_path(path, name)) {
            Ok(mut file) => {
                let mut buffer = Vec::new();
                file.read_to_end(&mut buffer)?;
                Ok(Some(buffer))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn remove(path: &Path, name: &str) -> io::Result<()> {
        match std::fs::remove_file(stream_path(path, name)) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

#[cfg(not(any(target_os = "linux", windows)))]
mod platform {
    use std::io;
    use std::path::Path;

    fn unsupported() -> io::Error {
        io::Error::new(io::ErrorKind::Unsupported, "sidecar tags unsupported on this platform")
    }

    pub fn write(_path: &Path, _name: &str, _value: &[u8]) -> io::Result<()> {
        Err(unsupported())
    }

    pub fn read(_path: &Path, _name: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(None)
    }

    pub fn remove(_path: &Path, _name: &str) -> io::Result<()> {
        Err(unsupported())
    }
}

/// Process-local sidecar for tests that must not depend on filesystem support
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct MemorySidecar {
    labels: dashmap::DashMap<std::path::PathBuf, Label>,
    writes: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl MemorySidecar {
    pub(crate) fn write_count(&self) -> usize {
        self.writes.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
impl SidecarAccessor for MemorySidecar {
    fn write(&self, path: &Path, label: &Label) -> Result<()> {
        NativeSidecar::ensure_file(path)?;
        self.labels.insert(path.to_path_buf(), label.clone());
        self.writes.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    fn read(&self, path: &Path) -> Option<Label> {
        self.labels.get(path).map(|entry| entry.value().clone())
    }

    fn remove(&self, path: &Path) -> Result<()> {
        self.labels.remove(path);
        Ok(())
    }
}
