//! Ingest orchestration
//!
//! Builds one [`Downloader`] per selected entity of a service, all sharing the
//! state store, the object store and the concurrency limiter, and feeds their
//! output into a single [`ObjectPublisher`]. A downloader that stops on a
//! permanent error cancels the whole pipeline.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, EntityConfig, ValidationError};
use crate::downloader::{DownloadError, Downloader, DownloaderSettings};
use crate::limiter::ConcurrencyLimiter;
use crate::observability::{Metrics, MetricsSnapshot};
use crate::publish::{
    AvgSampleRate, EventSink, HttpSink, ObjectPublisher, PublishError, Sampler, SamplerKind,
    StaticSampler, parser_for,
};
use crate::source::{LogSource, ServiceKind};
use crate::state::{
    DynamoTable, FileStater, StateError, Stater, TableStater, legacy_state_files,
};
use crate::storage::{LogStore, StorageClient};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ValidationError),

    #[error("Invalid entity filter: {0}")]
    InvalidFilter(#[from] regex::Error),

    #[error("No {service} entities match the given filters")]
    NoEntities { service: ServiceKind },

    #[error("State store unavailable: {0}")]
    State(#[from] StateError),

    #[error("Publisher setup failed: {0}")]
    Publish(#[from] PublishError),

    #[error("Downloader for {entity} stopped: {source}")]
    Download {
        entity: String,
        #[source]
        source: DownloadError,
    },

    #[error("Task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl IngestError {
    /// What the operator can do about it
    pub fn hint(&self) -> &'static str {
        match self {
            IngestError::Config(ValidationError::MissingWriteKey) => {
                "export LOGBUCKET_WRITE_KEY or pass --write-key"
            }
            IngestError::Config(_) => "fix the value in config/logbucket.toml or on the command line",
            IngestError::InvalidFilter(_) => "entity filters are regular expressions; check the syntax",
            IngestError::NoEntities { .. } => {
                "add [[entities]] for this service or loosen the filters; `ls` shows what is configured"
            }
            IngestError::State(_) => {
                "check AWS credentials and that the state table exists, or run without --high-availability"
            }
            IngestError::Publish(_) => "check the telemetry api_host, dataset and write key",
            IngestError::Download { .. } => {
                "check the bucket exists and the credentials in use may list and read it"
            }
            IngestError::Join(_) => "this is a bug; rerun with --debug and report the log",
        }
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;

/// Configured entities of `kind` whose name matches any of `patterns`.
/// No patterns selects every entity.
pub fn select_entities<'a>(
    config: &'a Config,
    kind: ServiceKind,
    patterns: &[String],
) -> Result<Vec<&'a EntityConfig>> {
    let filters = patterns
        .iter()
        .map(|p| Regex::new(p))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(config
        .entities_for(kind)
        .filter(|entity| filters.is_empty() || filters.iter().any(|re| re.is_match(&entity.name)))
        .collect())
}

/// Everything one run of the pipeline needs, already constructed
pub struct Pipeline {
    pub sources: Vec<LogSource>,
    pub store: Arc<dyn LogStore>,
    pub stater: Arc<dyn Stater>,
    pub limiter: ConcurrencyLimiter,
    pub settings: DownloaderSettings,
    pub output_buffer: usize,
    pub publisher: ObjectPublisher,
    pub metrics: Arc<Metrics>,
}

impl Pipeline {
    /// Run until `cancel` fires or a downloader fails permanently. Objects
    /// already handed over are still published before returning.
    pub async fn run(self, cancel: CancellationToken) -> Result<MetricsSnapshot> {
        let pipeline_cancel = cancel.child_token();
        let (tx, mut rx) = mpsc::channel(self.output_buffer.max(1));

        let mut downloaders = JoinSet::new();
        for source in self.sources {
            let downloader = Downloader::new(
                Arc::new(source),
                self.store.clone(),
                self.stater.clone(),
                self.limiter.clone(),
                self.settings.clone(),
                self.metrics.clone(),
            );
            let entity = downloader.identifier().to_string();
            let tx = tx.clone();
            let token = pipeline_cancel.clone();

            info!(entity = %entity, "Starting downloader");
            downloaders.spawn(async move { (entity, downloader.run(tx, token).await) });
        }
        // Only the downloaders hold senders now; the channel closes when they finish
        drop(tx);

        let mut fatal: Option<IngestError> = None;

        loop {
            tokio::select! {
                Some(object) = rx.recv() => {
                    // Failures are logged by the publisher; the object is not retried
                    let _ = self.publisher.publish(object).await;
                }
                Some(joined) = downloaders.join_next() => {
                    match joined {
                        Ok((entity, Ok(()))) => debug!(entity = %entity, "Downloader stopped"),
                        Ok((entity, Err(source))) => {
                            error!(entity = %entity, error = %source, "Downloader failed, stopping ingest");
                            pipeline_cancel.cancel();
                            fatal.get_or_insert(IngestError::Download { entity, source });
                        }
                        Err(e) => {
                            error!(error = %e, "Downloader task panicked, stopping ingest");
                            pipeline_cancel.cancel();
                            fatal.get_or_insert(IngestError::Join(e));
                        }
                    }
                }
                else => break,
            }
        }

        let snapshot = self.metrics.snapshot();
        snapshot.log_summary();

        match fatal {
            Some(e) => Err(e),
            None => Ok(snapshot),
        }
    }
}

/// Build the pipeline for `kind` from `config` and run it until cancelled
pub async fn ingest(
    config: &Config,
    kind: ServiceKind,
    patterns: &[String],
    cancel: CancellationToken,
) -> Result<MetricsSnapshot> {
    config.validate_for_ingest()?;

    let entities = select_entities(config, kind, patterns)?;
    if entities.is_empty() {
        return Err(IngestError::NoEntities { service: kind });
    }
    let sources: Vec<LogSource> = entities.iter().map(|e| e.to_source()).collect();

    let settings = config.downloader_settings();
    let stater = build_stater(config, kind, settings.backfill).await?;
    let store: Arc<dyn LogStore> = Arc::new(StorageClient::new(config.store_backend()));
    let limiter = ConcurrencyLimiter::from_limit(config.ingest.concurrency);
    let metrics = Arc::new(Metrics::new());

    let sink: Arc<dyn EventSink> = Arc::new(HttpSink::new(config.sink_config(kind))?);
    let publisher = ObjectPublisher::new(
        Arc::from(parser_for(kind)),
        build_sampler(config),
        sink,
        metrics.clone(),
    );

    info!(
        service = %kind,
        entities = sources.len(),
        backfill_hours = config.ingest.backfill_hours,
        high_availability = config.ingest.high_availability,
        concurrency = ?config.ingest.concurrency,
        mark_policy = ?settings.mark_policy,
        "Ingest starting"
    );

    Pipeline {
        sources,
        store,
        stater,
        limiter,
        settings,
        output_buffer: config.ingest.output_buffer,
        publisher,
        metrics,
    }
    .run(cancel)
    .await
}

/// File state in the state directory, or the shared table in HA mode. The
/// table must be reachable before anything starts.
async fn build_stater(
    config: &Config,
    kind: ServiceKind,
    backfill: chrono::Duration,
) -> Result<Arc<dyn Stater>> {
    if config.ingest.high_availability {
        let table = DynamoTable::from_env(
            &config.table.name,
            config.table.region.as_deref(),
            config.table.endpoint.as_deref(),
        )
        .await;
        let stater = TableStater::connect(Arc::new(table), backfill).await?;
        info!(table = %config.table.name, "Using shared state table");
        return Ok(Arc::new(stater));
    }

    let state_dir = &config.ingest.state_dir;
    match legacy_state_files(state_dir, kind.state_name()) {
        Ok(legacy) => {
            for path in legacy {
                warn!(
                    path = %path.display(),
                    "Ignoring per-entity state file from an older release; its objects may be ingested again"
                );
            }
        }
        Err(e) => warn!(dir = %state_dir.display(), error = %e, "Could not scan state directory"),
    }

    let stater = FileStater::new(state_dir, kind.state_name(), backfill);
    info!(path = %stater.path().display(), "Using state file");
    Ok(Arc::new(stater))
}

fn build_sampler(config: &Config) -> Arc<dyn Sampler> {
    let telemetry = &config.telemetry;
    match telemetry.sampler {
        SamplerKind::Static => Arc::new(StaticSampler::new(telemetry.sample_rate)),
        SamplerKind::Avg => Arc::new(AvgSampleRate::new(
            telemetry.sample_rate,
            Duration::from_secs(telemetry.sampler_interval_secs),
        )),
    }
}
