//! Path Filter Module
//!
//! Drops notifications for paths that are never audit-worthy: OS
//! bookkeeping, editor scratch files and the agent's own data directory
//! (its event database would otherwise feed notifications back into the
//! pipeline).

use std::path::{Path, PathBuf};

use glob::Pattern;
use serde::{Deserialize, Serialize};

use super::error::WatchError;

/// Configuration for path filtering
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathFilterConfig {
    /// Exclusion patterns (glob format)
    pub exclude_patterns: Vec<String>,
    /// Inclusion patterns, checked before exclusions
    pub include_patterns: Vec<String>,
    /// Directory trees excluded wholesale
    pub excluded_roots: Vec<PathBuf>,
}

impl Default for PathFilterConfig {
    fn default() -> Self {
        Self {
            exclude_patterns: default_exclude_patterns(),
            include_patterns: vec![],
            excluded_roots: vec![],
        }
    }
}

/// Built-in exclusions
pub fn default_exclude_patterns() -> Vec<String> {
    [
        // System directories (Windows)
        "**/System Volume Information/**",
        "**/$Recycle.Bin/**",
        "**/Windows/Prefetch/**",
        // Pseudo filesystems (Unix)
        "/proc/**",
        "/sys/**",
        "/dev/**",
        "/run/**",
        // Scratch files
        "**/*.tmp",
        "**/*.swp",
        "**/~$*",
        "**/.DS_Store",
        "**/Thumbs.db",
    ]
    .iter()
    .map(|p| p.to_string())
    .collect()
}

/// Result of filtering a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterResult {
    Include,
    Exclude(FilterReason),
}

/// Reason for excluding a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterReason {
    /// Matches an exclusion pattern
    Pattern,
    /// Inside an excluded root, e.g. the agent's data directory
    ExcludedRoot,
}

/// Glob-based path filter
#[derive(Debug)]
pub struct PathFilter {
    config: PathFilterConfig,
    exclude_matchers: Vec<Pattern>,
    include_matchers: Vec<Pattern>,
}

fn compile(patterns: &[String]) -> Result<Vec<Pattern>, WatchError> {
    patterns
        .iter()
        .map(|p| {
            Pattern::new(p).map_err(|e| WatchError::InvalidPattern {
                pattern: p.clone(),
                reason: e.to_string(),
            })
        })
        .collect()
}

impl PathFilter {
    pub fn new(config: PathFilterConfig) -> Result<Self, WatchError> {
        Ok(Self {
            exclude_matchers: compile(&config.exclude_patterns)?,
            include_matchers: compile(&config.include_patterns)?,
            config,
        })
    }

    pub fn with_defaults() -> Result<Self, WatchError> {
        Self::new(PathFilterConfig::default())
    }

    /// Filter that lets everything through
    pub fn allow_all() -> Self {
        Self {
            config: PathFilterConfig {
                exclude_patterns: vec![],
                include_patterns: vec![],
                excluded_roots: vec![],
            },
            exclude_matchers: vec![],
            include_matchers: vec![],
        }
    }

    /// Exclude everything under `root`
    pub fn exclude_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.excluded_roots.push(root.into());
        self
    }

    pub fn should_filter(&self, path: &Path) -> FilterResult {
        if self
            .config
            .excluded_roots
            .iter()
            .any(|root| path.starts_with(root))
        {
            return FilterResult::Exclude(FilterReason::ExcludedRoot);
        }

        // Normalize path separators for cross-platform matching
        let normalized = path.to_string_lossy().replace('\\', "/");

        if self.include_matchers.iter().any(|m| m.matches(&normalized)) {
            return FilterResult::Include;
        }
        if self.exclude_matchers.iter().any(|m| m.matches(&normalized)) {
            return FilterResult::Exclude(FilterReason::Pattern);
        }

        FilterResult::Include
    }

    pub fn is_excluded(&self, path: &Path) -> bool {
        matches!(self.should_filter(path), FilterResult::Exclude(_))
    }

    pub fn config(&self) -> &PathFilterConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scratch_files_excluded() {
        let filter = PathFilter::with_defaults().unwrap();
        for path in ["/home/u/doc.swp", "C:\\Users\\u\\~$report.docx", "/tmp/x/build.tmp"] {
            assert_eq!(
                filter.should_filter(Path::new(path)),
                FilterResult::Exclude(FilterReason::Pattern),
                "{}",
                path
            );
        }
    }

    #[test]
    fn test_windows_system_dirs_excluded() {
        let filter = PathFilter::with_defaults().unwrap();
        let path = Path::new("D:\\System Volume Information\\tracking.log");
        assert!(filter.is_excluded(path));
    }

    #[test]
    fn test_normal_path_included() {
        let filter = PathFilter::with_defaults().unwrap();
        assert_eq!(
            filter.should_filter(Path::new("/home/user/documents/report.xlsx")),
            FilterResult::Include
        );
    }

    #[test]
    fn test_include_overrides_exclude() {
        let filter = PathFilter::new(PathFilterConfig {
            exclude_patterns: vec!["**/scratch/**".to_string()],
            include_patterns: vec!["**/scratch/keep/**".to_string()],
            excluded_roots: vec![],
        })
        .unwrap();

        assert!(filter.is_excluded(Path::new("/data/scratch/a.txt")));
        assert!(!filter.is_excluded(Path::new("/data/scratch/keep/a.txt")));
    }

    #[test]
    fn test_excluded_root_wins_over_include() {
        let filter = PathFilter::new(PathFilterConfig {
            exclude_patterns: vec![],
            include_patterns: vec!["**".to_string()],
            excluded_roots: vec![],
        })
        .unwrap()
        .exclude_root("/var/lib/dlp");

        assert_eq!(
            filter.should_filter(Path::new("/var/lib/dlp/events.db-wal")),
            FilterResult::Exclude(FilterReason::ExcludedRoot)
        );
        assert!(!filter.is_excluded(Path::new("/var/lib/dlpx/file")));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let result = PathFilter::new(PathFilterConfig {
            exclude_patterns: vec!["[".to_string()],
            ..Default::default()
        });
        assert!(matches!(result, Err(WatchError::InvalidPattern { .. })));
    }
}
