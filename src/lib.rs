//! Subvault - subscription download orchestration library
//!
//! This library coordinates media downloads for a personal subscription
//! vault: observable per-attempt progress, deduplicated submissions,
//! bounded retries, and durable record-keeping decoupled from the
//! download path.

pub mod core;

// Re-export commonly used types
pub use crate::core::{
    catalog::{CatalogConfig, HttpCatalogClient, VideoCatalogClient},
    config::AppConfig,
    coordinator::{DownloadCoordinator, DownloadHandle},
    error_handling::{FetchError, FetchErrorKind, PersistenceError, RetryPolicy, SignalError},
    listeners::{ListenerRegistry, SubscriptionId},
    models::{
        AppError, AppResult, DownloadArtifact, DownloadConfig, DownloadPriority, DownloadState,
        Listener, ProgressSnapshot, SubmitOptions, VideoRecord,
    },
    persistence::{JsonRecordStore, PersistenceUpdater, RecordStore},
    progress::ProgressSignal,
    task::CancelToken,
};

use std::sync::Arc;

/// Application state wiring the coordinator to its configured backends
#[derive(Clone)]
pub struct Subvault {
    pub coordinator: Arc<DownloadCoordinator>,
    pub store: Arc<JsonRecordStore>,
    pub config: Arc<tokio::sync::RwLock<AppConfig>>,
}

impl std::fmt::Debug for Subvault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subvault").finish_non_exhaustive()
    }
}

impl Subvault {
    /// Build from the on-disk configuration, creating it when missing
    pub async fn new() -> AppResult<Self> {
        Self::with_config(Self::load_or_initialize_config()).await
    }

    /// Build from an explicit configuration
    pub async fn with_config(config: AppConfig) -> AppResult<Self> {
        let records_path = config
            .records_path()
            .map_err(|e| AppError::Config(e.to_string()))?;
        let store = Arc::new(JsonRecordStore::open(records_path).await?);

        let catalog = Arc::new(HttpCatalogClient::new(&config.catalog, &config.download)?);
        let updater = Arc::new(PersistenceUpdater::new(
            store.clone(),
            config.persist_retry_policy(),
        ));
        let coordinator = Arc::new(DownloadCoordinator::new(
            catalog,
            updater,
            config.download.clone(),
        ));

        Ok(Self {
            coordinator,
            store,
            config: Arc::new(tokio::sync::RwLock::new(config)),
        })
    }

    /// Durable record for a video, if one exists
    pub async fn record(&self, video_id: &str) -> AppResult<Option<VideoRecord>> {
        Ok(self.store.load(video_id).await?)
    }

    fn load_or_initialize_config() -> AppConfig {
        match AppConfig::load() {
            Ok(cfg) => {
                if let Err(err) = cfg.validate() {
                    tracing::warn!(
                        "Invalid configuration detected ({}), falling back to defaults",
                        err
                    );
                    let default_cfg = AppConfig::default();
                    if let Err(save_err) = default_cfg.save() {
                        tracing::warn!("Failed to persist default configuration: {}", save_err);
                    }
                    default_cfg
                } else {
                    cfg
                }
            }
            Err(err) => {
                tracing::warn!(
                    "Failed to load configuration from disk: {}. Using defaults",
                    err
                );
                let default_cfg = AppConfig::default();
                if let Err(save_err) = default_cfg.save() {
                    tracing::warn!("Failed to persist default configuration: {}", save_err);
                }
                default_cfg
            }
        }
    }
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Initialize the library with default settings
pub fn init() -> anyhow::Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "subvault=info");
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .ok(); // ignore double initialization

    tracing::info!("📚 {} v{} initialized", NAME, VERSION);
    Ok(())
}
