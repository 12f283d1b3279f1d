use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::downloader::MarkPolicy;
use crate::publish::SamplerKind;
use crate::source::{
    AlbSource, CloudFrontSource, CloudTrailSource, ElbSource, LogSource, ServiceKind,
};
use crate::state::DEFAULT_TABLE_NAME;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub table: TableConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub entities: Vec<EntityConfig>,
}

/// Polling, state and download settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestConfig {
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// How far back objects are still ingested, 1 to 168 hours
    #[serde(default = "default_backfill_hours")]
    pub backfill_hours: u32,
    /// Share processed-object state through the table instead of a local file
    #[serde(default)]
    pub high_availability: bool,
    /// Process-wide cap on simultaneous downloads; unset means no cap
    pub concurrency: Option<usize>,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// Capacity of the channel between downloaders and the publisher
    #[serde(default = "default_output_buffer")]
    pub output_buffer: usize,
    /// Where objects are downloaded to; the system temp dir when unset
    pub temp_dir: Option<PathBuf>,
    #[serde(default)]
    pub mark_policy: MarkPolicy,
}

impl IngestConfig {
    pub fn backfill(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.backfill_hours))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            backfill_hours: default_backfill_hours(),
            high_availability: false,
            concurrency: None,
            workers: default_workers(),
            poll_interval_secs: default_poll_interval_secs(),
            page_size: default_page_size(),
            queue_size: default_queue_size(),
            output_buffer: default_output_buffer(),
            temp_dir: None,
            mark_policy: MarkPolicy::default(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_backfill_hours() -> u32 {
    1
}

fn default_workers() -> usize {
    1
}

fn default_poll_interval_secs() -> u64 {
    300
}

fn default_page_size() -> usize {
    1000
}

fn default_queue_size() -> usize {
    100
}

fn default_output_buffer() -> usize {
    1
}

/// Storage provider type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageProvider {
    #[default]
    S3,
    Local,
    Memory,
}

/// Where log buckets are read from
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub provider: StorageProvider,
    pub region: Option<String>,
    /// S3-compatible endpoint override (MinIO, LocalStack)
    pub endpoint: Option<String>,
    /// Root directory holding one sub-directory per bucket (local provider)
    #[serde(default = "default_local_root")]
    pub local_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            provider: StorageProvider::default(),
            region: None,
            endpoint: None,
            local_root: default_local_root(),
        }
    }
}

fn default_local_root() -> PathBuf {
    PathBuf::from("data/buckets")
}

/// Shared state table used in high-availability mode
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TableConfig {
    #[serde(default = "default_table_name")]
    pub name: String,
    pub region: Option<String>,
    pub endpoint: Option<String>,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            name: default_table_name(),
            region: None,
            endpoint: None,
        }
    }
}

fn default_table_name() -> String {
    DEFAULT_TABLE_NAME.to_string()
}

/// Event delivery settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_api_host")]
    pub api_host: String,
    /// Dataset name; each service has its own default
    pub dataset: Option<String>,
    /// Goal rate: keep about one in `sample_rate` events
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default)]
    pub sampler: SamplerKind,
    #[serde(default = "default_sampler_interval_secs")]
    pub sampler_interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Team write key (loaded from environment or CLI, never from the file)
    #[serde(skip)]
    pub write_key: Option<String>,
}

impl TelemetryConfig {
    pub fn dataset_for(&self, kind: ServiceKind) -> String {
        self.dataset
            .clone()
            .unwrap_or_else(|| kind.default_dataset().to_string())
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            api_host: default_api_host(),
            dataset: None,
            sample_rate: default_sample_rate(),
            sampler: SamplerKind::default(),
            sampler_interval_secs: default_sampler_interval_secs(),
            batch_size: default_batch_size(),
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
            write_key: None,
        }
    }
}

fn default_api_host() -> String {
    "https://api.honeycomb.io/".to_string()
}

fn default_sample_rate() -> u32 {
    1
}

fn default_sampler_interval_secs() -> u64 {
    300
}

fn default_batch_size() -> usize {
    500
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

/// One watched entity: a load balancer, distribution or trail
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EntityConfig {
    pub kind: ServiceKind,
    /// Load balancer name, distribution id or trail name
    pub name: String,
    pub bucket: String,
    /// Key prefix configured on the log delivery, if any
    #[serde(default)]
    pub prefix: String,
    pub account_id: Option<String>,
    pub region: Option<String>,
    /// CloudTrail organization trails only
    pub org_id: Option<String>,
}

impl EntityConfig {
    /// Build the entity's log source. Validation guarantees the fields each
    /// kind needs, so missing ones fall back to empty strings here.
    pub fn to_source(&self) -> LogSource {
        let account = self.account_id.clone().unwrap_or_default();
        let region = self.region.clone().unwrap_or_default();

        match self.kind {
            ServiceKind::Elb => LogSource::Elb(ElbSource::new(
                account,
                region,
                &self.bucket,
                &self.prefix,
                &self.name,
            )),
            ServiceKind::Alb => LogSource::Alb(AlbSource::new(ElbSource::new(
                account,
                region,
                &self.bucket,
                &self.prefix,
                &self.name,
            ))),
            ServiceKind::CloudFront => {
                LogSource::CloudFront(CloudFrontSource::new(&self.bucket, &self.prefix, &self.name))
            }
            ServiceKind::CloudTrail => LogSource::CloudTrail(CloudTrailSource::new(
                account,
                region,
                &self.bucket,
                &self.prefix,
                &self.name,
                self.org_id.clone(),
            )),
        }
    }
}
