//! Application configuration management

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::catalog::CatalogConfig;
use super::error_handling::RetryPolicy;
use super::models::DownloadConfig;

/// Main application configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub download: DownloadConfig,
    pub catalog: CatalogConfig,
    pub storage: StorageConfig,
    pub advanced: AdvancedConfig,
}

/// Storage-related configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path of the video record document; defaults to the data directory
    pub records_path: Option<PathBuf>,
    pub persist_retry_attempts: u32,
    pub persist_retry_base_delay_ms: u64,
}

/// Advanced configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvancedConfig {
    pub enable_logging: bool,
    pub log_level: String, // "error", "warn", "info", "debug", "trace"
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            records_path: None,
            persist_retry_attempts: 3,
            persist_retry_base_delay_ms: 500,
        }
    }
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        Self {
            enable_logging: true,
            log_level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from file, creating default if not exists
    pub fn load() -> Result<Self> {
        let config_path = Self::get_config_path()?;

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

            let config: AppConfig =
                serde_json::from_str(&content).with_context(|| "Failed to parse config file")?;

            tracing::info!("Loaded configuration from: {:?}", config_path);
            Ok(config)
        } else {
            let config = Self::default();
            config.save()?;
            tracing::info!("Created default configuration at: {:?}", config_path);
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = Self::get_config_path()?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content =
            serde_json::to_string_pretty(self).with_context(|| "Failed to serialize config")?;

        std::fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        tracing::info!("Saved configuration to: {:?}", config_path);
        Ok(())
    }

    /// Get the path to the configuration file
    pub fn get_config_path() -> Result<PathBuf> {
        let project_dirs = ProjectDirs::from("io", "subvault", "subvault")
            .with_context(|| "Failed to get project directories")?;

        Ok(project_dirs.config_dir().join("config.json"))
    }

    /// Get the application data directory
    pub fn get_data_dir() -> Result<PathBuf> {
        let project_dirs = ProjectDirs::from("io", "subvault", "subvault")
            .with_context(|| "Failed to get project directories")?;

        Ok(project_dirs.data_dir().to_path_buf())
    }

    /// Resolve where the video record document lives
    pub fn records_path(&self) -> Result<PathBuf> {
        match &self.storage.records_path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::get_data_dir()?.join("records.json")),
        }
    }

    /// Retry policy applied by the persistence updater
    pub fn persist_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.storage.persist_retry_attempts.max(1),
            base_delay: std::time::Duration::from_millis(self.storage.persist_retry_base_delay_ms),
            ..Default::default()
        }
    }

    /// Reset configuration to defaults
    pub fn reset() -> Result<Self> {
        let config = Self::default();
        config.save()?;
        tracing::info!("Reset configuration to defaults");
        Ok(config)
    }

    /// Export configuration as JSON string
    pub fn export(&self) -> Result<String> {
        serde_json::to_string_pretty(self).with_context(|| "Failed to export configuration")
    }

    /// Import configuration from JSON string
    pub fn import(json: &str) -> Result<Self> {
        let config: AppConfig =
            serde_json::from_str(json).with_context(|| "Failed to parse imported configuration")?;

        config
            .validate()
            .with_context(|| "Imported configuration is invalid")?;

        config.save()?;
        tracing::info!("Imported and validated configuration from JSON");
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.download.concurrent_downloads == 0 {
            anyhow::bail!("Concurrent downloads must be greater than 0");
        }

        if self.download.concurrent_downloads > 20 {
            anyhow::bail!("Concurrent downloads should not exceed 20");
        }

        if self.download.fetch_retry_attempts == 0 || self.download.fetch_retry_attempts > 10 {
            anyhow::bail!("Fetch retry attempts should be between 1 and 10");
        }

        if self.download.timeout_seconds == 0 || self.download.timeout_seconds > 300 {
            anyhow::bail!("Timeout should be between 1 and 300 seconds");
        }

        if self.download.retry_base_delay_ms == 0 {
            anyhow::bail!("Retry base delay must be greater than 0");
        }

        if self.download.retry_max_delay_ms < self.download.retry_base_delay_ms {
            anyhow::bail!("Retry max delay must be at least the base delay");
        }

        if url::Url::parse(&self.catalog.base_url).is_err() {
            anyhow::bail!("Catalog base URL is not a valid URL: {}", self.catalog.base_url);
        }

        if self.storage.persist_retry_attempts == 0 || self.storage.persist_retry_attempts > 10 {
            anyhow::bail!("Persistence retry attempts should be between 1 and 10");
        }

        if !["error", "warn", "info", "debug", "trace"]
            .contains(&self.advanced.log_level.as_str())
        {
            anyhow::bail!(
                "Invalid log level: must be 'error', 'warn', 'info', 'debug', or 'trace'"
            );
        }

        Ok(())
    }
}
