//! Volume enumeration

use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Roots to watch
///
/// A configured list is used as given, minus repeats. Otherwise every
/// mounted drive letter on Windows, and the user's home directory elsewhere
/// (watching `/` recursively would subscribe to pseudo filesystems).
pub fn enumerate_volumes(configured: &[PathBuf]) -> Vec<PathBuf> {
    if !configured.is_empty() {
        let mut seen = HashSet::new();
        return configured
            .iter()
            .filter(|volume| seen.insert(volume.as_path()))
            .cloned()
            .collect();
    }
    platform_volumes()
}

#[cfg(windows)]
fn platform_volumes() -> Vec<PathBuf> {
    ('A'..='Z')
        .map(|letter| PathBuf::from(format!("{}:\\", letter)))
        .filter(|root| root.is_dir())
        .collect()
}

#[cfg(not(windows))]
fn platform_volumes() -> Vec<PathBuf> {
    match dirs::home_dir() {
        Some(home) if home != Path::new("/") => vec![home],
        _ => {
            tracing::warn!("No home directory to watch; configure monitoring.volumes explicitly");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_volumes_win() {
        let configured = vec![PathBuf::from("/mnt/a"), PathBuf::from("/mnt/b")];
        assert_eq!(enumerate_volumes(&configured), configured);
    }

    #[test]
    fn test_repeated_volumes_are_dropped_in_order() {
        let configured = vec![
            PathBuf::from("/mnt/a"),
            PathBuf::from("/mnt/b"),
            PathBuf::from("/mnt/a"),
        ];
        assert_eq!(
            enumerate_volumes(&configured),
            vec![PathBuf::from("/mnt/a"), PathBuf::from("/mnt/b")]
        );
    }

    #[test]
    fn test_auto_enumeration_never_watches_filesystem_root() {
        let volumes = enumerate_volumes(&[]);
        assert!(volumes.iter().all(|v| v != Path::new("/")));
    }
}
