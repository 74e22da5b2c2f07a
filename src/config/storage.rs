//! Configuration storage
//!
//! JSON file on disk, loaded once at startup:
//! - Atomic writes using temp file + rename
//! - Backup of the previous file before each write
//! - Default configuration generated when the file is missing
//! - Environment overrides applied after load

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::logging::LoggingConfig;

/// Config file path override
pub const ENV_CONFIG_PATH: &str = "DLP_CONFIG";
/// Data directory override
pub const ENV_DATA_DIR: &str = "DLP_DATA_DIR";
/// API port override
pub const ENV_API_PORT: &str = "DLP_API_PORT";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

impl From<ConfigError> for crate::core::DlpError {
    fn from(err: ConfigError) -> Self {
        crate::core::DlpError::Config(err.to_string())
    }
}

/// Where the configuration lives
#[derive(Debug, Clone)]
pub struct ConfigStoreConfig {
    pub config_path: PathBuf,
    pub backup_dir: PathBuf,
    /// Maximum number of backups to keep
    pub max_backups: usize,
    /// Whether to create default config if not exists
    pub create_default: bool,
}

impl Default for ConfigStoreConfig {
    fn default() -> Self {
        let config_path = std::env::var_os(ENV_CONFIG_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|| default_data_dir().join("config.json"));
        let backup_dir = config_path
            .parent()
            .map(|p| p.join("backups"))
            .unwrap_or_else(|| PathBuf::from("backups"));

        Self {
            config_path,
            backup_dir,
            max_backups: 5,
            create_default: true,
        }
    }
}

/// Per-machine data directory
///
/// The platform's local data dir, else `%PROGRAMDATA%\DLP` on Windows,
/// else `./dlp-data`.
pub fn default_data_dir() -> PathBuf {
    if let Some(dirs) = directories::ProjectDirs::from("", "", "dlp-monitor") {
        return dirs.data_local_dir().to_path_buf();
    }
    if cfg!(windows) {
        if let Some(program_data) = std::env::var_os("PROGRAMDATA") {
            return PathBuf::from(program_data).join("DLP");
        }
    }
    PathBuf::from("dlp-data")
}

/// Main application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub version: u32,
    pub storage: StorageConfig,
    pub monitoring: MonitoringConfig,
    pub api: ApiConfig,
    pub logging: LoggingConfig,
    pub last_modified: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            version: 1,
            storage: StorageConfig::default(),
            monitoring: MonitoringConfig::default(),
            api: ApiConfig::default(),
            logging: LoggingConfig::default(),
            last_modified: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Database locations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// Tag store file, relative to `data_dir`
    pub tag_db_file: String,
    /// Event log file, relative to `data_dir`
    pub events_db_file: String,
    pub enable_wal: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            tag_db_file: "dlp.db".to_string(),
            events_db_file: "events.db".to_string(),
            enable_wal: true,
        }
    }
}

impl StorageConfig {
    pub fn tag_db_path(&self) -> PathBuf {
        self.data_dir.join(&self.tag_db_file)
    }

    pub fn events_db_path(&self) -> PathBuf {
        self.data_dir.join(&self.events_db_file)
    }
}

/// Watcher and classifier tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Roots to watch; empty means every local volume
    pub volumes: Vec<PathBuf>,
    pub sidecar_name: String,
    pub rename_window_ms: u64,
    pub debounce_ms: u64,
    pub classifier_workers: usize,
    pub queue_capacity: usize,
    pub watcher_backoff_ms: u64,
    pub watcher_max_backoff_ms: u64,
    pub stop_timeout_ms: u64,
    pub append_max_retries: u32,
    pub append_retry_base_ms: u64,
    pub self_write_suppression_ms: u64,
    pub exclude_patterns: Vec<String>,
    /// Start monitoring as soon as the service is up
    pub auto_start: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            volumes: Vec::new(),
            sidecar_name: "dlp".to_string(),
            rename_window_ms: 500,
            debounce_ms: 100,
            classifier_workers: 4,
            queue_capacity: 1024,
            watcher_backoff_ms: 1000,
            watcher_max_backoff_ms: 30_000,
            stop_timeout_ms: 5000,
            append_max_retries: 3,
            append_retry_base_ms: 100,
            self_write_suppression_ms: 2000,
            exclude_patterns: crate::watcher::default_exclude_patterns(),
            auto_start: true,
        }
    }
}

impl MonitoringConfig {
    pub fn rename_window(&self) -> Duration {
        Duration::from_millis(self.rename_window_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn self_write_window(&self) -> Duration {
        Duration::from_millis(self.self_write_suppression_ms)
    }
}

/// HTTP control surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub port: u16,
    /// CORS origins; empty allows any origin
    pub allowed_origins: Vec<String>,
    /// Bearer token required on every route except `/health`
    pub require_token: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1".to_string(),
            port: 5000,
            allowed_origins: Vec::new(),
            require_token: None,
        }
    }
}

impl AppConfig {
    /// Apply `DLP_DATA_DIR` and `DLP_API_PORT`
    pub fn apply_env_overrides(&mut self) -> ConfigResult<()> {
        self.apply_overrides(
            std::env::var(ENV_DATA_DIR).ok(),
            std::env::var(ENV_API_PORT).ok(),
        )
    }

    pub(crate) fn apply_overrides(&mut self, data_dir: Option<String>, port: Option<String>) -> ConfigResult<()> {
        if let Some(dir) = data_dir.filter(|d| !d.trim().is_empty()) {
            self.storage.data_dir = PathBuf::from(dir);
        }
        if let Some(port) = port {
            self.api.port = port
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("{} is not a port: {:?}", ENV_API_PORT, port)))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let monitoring = &self.monitoring;
        if monitoring.classifier_workers == 0 {
            return Err(ConfigError::Invalid("monitoring.classifier_workers must be at least 1".into()));
        }
        if monitoring.queue_capacity == 0 {
            return Err(ConfigError::Invalid("monitoring.queue_capacity must be at least 1".into()));
        }
        if monitoring.rename_window_ms == 0 {
            return Err(ConfigError::Invalid("monitoring.rename_window_ms must be positive".into()));
        }
        if monitoring.watcher_max_backoff_ms < monitoring.watcher_backoff_ms {
            return Err(ConfigError::Invalid(
                "monitoring.watcher_max_backoff_ms is below watcher_backoff_ms".into(),
            ));
        }
        if monitoring.sidecar_name.trim().is_empty() {
            return Err(ConfigError::Invalid("monitoring.sidecar_name must not be empty".into()));
        }
        for pattern in &monitoring.exclude_patterns {
            glob::Pattern::new(pattern)
                .map_err(|e| ConfigError::Invalid(format!("exclude pattern {:?}: {}", pattern, e)))?;
        }
        if self.storage.tag_db_file == self.storage.events_db_file {
            return Err(ConfigError::Invalid(
                "tag store and event log must use different files".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration store with thread-safe access
pub struct ConfigStore {
    config: Arc<RwLock<AppConfig>>,
    settings: ConfigStoreConfig,
}

impl ConfigStore {
    /// Load the file (creating it when allowed), apply env overrides, validate
    pub async fn new(settings: ConfigStoreConfig) -> ConfigResult<Self> {
        if let Some(parent) = settings.config_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut config = if settings.config_path.exists() {
            Self::load_from_file(&settings.config_path).await?
        } else if settings.create_default {
            let default_config = AppConfig::default();
            Self::save_to_file(&settings.config_path, &default_config).await?;
            tracing::info!(path = %settings.config_path.display(), "Created default configuration");
            default_config
        } else {
            return Err(ConfigError::NotFound(settings.config_path.clone()));
        };

        config.apply_env_overrides()?;
        config.validate()?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            settings,
        })
    }

    async fn load_from_file(path: &Path) -> ConfigResult<AppConfig> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Write to a temp file, then rename over the target
    async fn save_to_file(path: &Path, config: &AppConfig) -> ConfigResult<()> {
        let content = serde_json::to_string_pretty(config)?;
        let temp_path = path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, &content).await?;
        tokio::fs::rename(&temp_path, path).await?;
        Ok(())
    }

    pub async fn get(&self) -> AppConfig {
        self.config.read().await.clone()
    }

    /// Apply `updater`, validate, back up the old file and persist
    pub async fn update<F>(&self, updater: F) -> ConfigResult<AppConfig>
    where
        F: FnOnce(&mut AppConfig),
    {
        let mut config = self.config.write().await;

        let mut updated = config.clone();
        updater(&mut updated);
        updated.validate()?;
        updated.last_modified = chrono::Utc::now().to_rfc3339();

        self.create_backup(&config).await?;
        Self::save_to_file(&self.settings.config_path, &updated).await?;
        *config = updated;

        Ok(config.clone())
    }

    pub async fn reset(&self) -> ConfigResult<AppConfig> {
        self.update(|config| *config = AppConfig::default()).await
    }

    async fn create_backup(&self, config: &AppConfig) -> ConfigResult<()> {
        tokio::fs::create_dir_all(&self.settings.backup_dir).await?;
        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S%.6f");
        let backup_path = self
            .settings
            .backup_dir
            .join(format!("config_backup_{}.json", timestamp));

        Self::save_to_file(&backup_path, config).await?;
        self.cleanup_old_backups().await
    }

    async fn cleanup_old_backups(&self) -> ConfigResult<()> {
        let mut backups = self.list_backups().await?;
        while backups.len() > self.settings.max_backups {
            let oldest = backups.remove(0);
            tokio::fs::remove_file(&oldest).await?;
        }
        Ok(())
    }

    /// Backups, oldest first
    pub async fn list_backups(&self) -> ConfigResult<Vec<PathBuf>> {
        if !self.settings.backup_dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = tokio::fs::read_dir(&self.settings.backup_dir).await?;
        let mut backups: Vec<PathBuf> = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                backups.push(path);
            }
        }

        backups.sort();
        Ok(backups)
    }

    pub fn config_path(&self) -> &Path {
        &self.settings.config_path
    }
}

