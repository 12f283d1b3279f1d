//! Configuration management for logbucket
//!
//! This module provides a layered configuration system that loads settings from:
//! 1. Default values (embedded in structs)
//! 2. TOML configuration file
//! 3. Environment variables
//! 4. Command-line flags (applied by the CLI on top, highest priority)
//!
//! # Usage
//!
//! ```no_run
//! use logbucket::config::Config;
//!
//! let config = Config::load(None).expect("Failed to load configuration");
//! println!("Backfill window: {}h", config.ingest.backfill_hours);
//! ```
//!
//! # Environment Variables
//!
//! Configuration can be overridden using environment variables with the pattern:
//! `LOGBUCKET__<section>__<key>`
//!
//! Examples:
//! - `LOGBUCKET__INGEST__BACKFILL_HOURS=6`
//! - `LOGBUCKET__INGEST__HIGH_AVAILABILITY=true`
//! - `LOGBUCKET__TELEMETRY__DATASET=alb-prod`
//!
//! The write key is a secret and only comes from `LOGBUCKET_WRITE_KEY` or the
//! command line.
//!
//! # Configuration File
//!
//! By default, the configuration is loaded from `config/logbucket.toml`.
//! This can be overridden using the `LOGBUCKET_CONFIG` environment variable.

mod models;
mod sources;
mod validation;

// Re-export public types
pub use models::{
    Config, EntityConfig, IngestConfig, StorageConfig, StorageProvider, TableConfig,
    TelemetryConfig,
};
pub use sources::{CONFIG_ENV_VAR, WRITE_KEY_ENV_VAR};
pub use validation::{MAX_BACKFILL_HOURS, MIN_BACKFILL_HOURS, ValidationError};

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::downloader::DownloaderSettings;
use crate::publish::SinkConfig;
use crate::source::ServiceKind;
use crate::storage::StoreBackend;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Configuration validation failed: {0}")]
    ValidationError(#[from] ValidationError),
}

impl Config {
    /// Load configuration from all sources (file + environment)
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file is malformed or a value
    /// fails validation.
    pub fn load(path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let config = sources::load(path)?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific path, without the `.env` file or
    /// environment secrets
    pub fn load_from_path(path: PathBuf) -> Result<Self, ConfigError> {
        let config = sources::load_from_sources(path)?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Re-check after command-line overrides were applied
    pub fn validate(&self) -> Result<(), ValidationError> {
        validation::validate(self)
    }

    pub fn validate_for_ingest(&self) -> Result<(), ValidationError> {
        validation::validate_for_ingest(self)
    }

    /// Configured entities of one service, in file order
    pub fn entities_for(&self, kind: ServiceKind) -> impl Iterator<Item = &EntityConfig> {
        self.entities.iter().filter(move |e| e.kind == kind)
    }

    pub fn downloader_settings(&self) -> DownloaderSettings {
        let ingest = &self.ingest;
        DownloaderSettings::builder()
            .backfill(ingest.backfill())
            .poll_interval(ingest.poll_interval())
            .workers(ingest.workers)
            .queue_size(ingest.queue_size)
            .page_size(ingest.page_size)
            .temp_dir(ingest.temp_dir())
            .mark_policy(ingest.mark_policy)
            .build()
    }

    /// Sink settings for `kind`; the write key must already be present
    pub fn sink_config(&self, kind: ServiceKind) -> SinkConfig {
        let telemetry = &self.telemetry;
        SinkConfig {
            api_host: telemetry.api_host.clone(),
            dataset: telemetry.dataset_for(kind),
            write_key: telemetry.write_key.clone().unwrap_or_default(),
            batch_size: telemetry.batch_size,
            request_timeout: Duration::from_secs(telemetry.request_timeout_secs),
            max_retries: telemetry.max_retries,
            ..SinkConfig::default()
        }
    }

    pub fn store_backend(&self) -> StoreBackend {
        match self.storage.provider {
            StorageProvider::S3 => StoreBackend::S3 {
                region: self.storage.region.clone(),
                endpoint: self.storage.endpoint.clone(),
            },
            StorageProvider::Local => StoreBackend::Local {
                root: self.storage.local_root.clone(),
            },
            StorageProvider::Memory => StoreBackend::Memory,
        }
    }
}
