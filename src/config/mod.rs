//! Configuration management for the DLP monitor
//!
//! JSON file-based settings with atomic writes, backups, environment
//! overrides (`DLP_CONFIG`, `DLP_DATA_DIR`, `DLP_API_PORT`) and validation.

mod storage;

pub use storage::{
    default_data_dir, ApiConfig, AppConfig, ConfigError, ConfigResult, ConfigStore,
    ConfigStoreConfig, MonitoringConfig, StorageConfig, ENV_API_PORT, ENV_CONFIG_PATH,
    ENV_DATA_DIR,
};
