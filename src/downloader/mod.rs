//! Per-entity download pipeline
//!
//! A [`Downloader`] watches one entity. Its poll loop lists the objects under
//! today's key prefix, filters out anything already processed, stale, or still
//! in flight, and hands the rest to a small pool of workers through
//! [`broker::WorkDispatcher`]. Workers fetch each object into a uniquely named
//! temp file (under the shared [`ConcurrencyLimiter`]) and emit a
//! [`DownloadedObject`] on the output channel.
//!
//! ```text
//! poll tick -> list pages -> sort newest first -> filter -> dispatch
//!                                                              |
//!      out channel <- DownloadedObject <- download <- limiter <- worker
//! ```

pub mod broker;
pub mod error;
mod poller;
mod worker;

pub use broker::{Candidate, WorkDispatcher};
pub use error::{DownloadError, Result};
pub use poller::PollSummary;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::limiter::ConcurrencyLimiter;
use crate::observability::Metrics;
use crate::source::ObjectSource;
use crate::state::{ProcessedObjects, Stater};
use crate::storage::LogStore;

/// A fetched object waiting for the consumer. The consumer owns `local_path`
/// and must delete it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedObject {
    pub object_key: String,
    pub local_path: PathBuf,
}

/// When an object is recorded as processed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkPolicy {
    /// After the consumer has received the object (at-least-once)
    #[default]
    AfterDownload,
    /// When the object is scheduled (at-most-once)
    BeforeDownload,
}

#[derive(Debug, Clone, bon::Builder)]
pub struct DownloaderSettings {
    /// Maximum object age and record retention
    pub backfill: chrono::Duration,
    #[builder(default = Duration::from_secs(300))]
    pub poll_interval: Duration,
    #[builder(default = 1)]
    pub workers: usize,
    /// Capacity of each worker's channel
    #[builder(default = 100)]
    pub queue_size: usize,
    #[builder(default = 1000)]
    pub page_size: usize,
    #[builder(default = std::env::temp_dir())]
    pub temp_dir: PathBuf,
    #[builder(default)]
    pub mark_policy: MarkPolicy,
}

/// Keys this downloader is working on or has recently finished.
///
/// A finished key stays blocked until a processed-objects snapshot contains
/// it, so a snapshot read before the worker recorded the key cannot schedule
/// it again.
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    inner: Mutex<InFlightKeys>,
}

#[derive(Debug, Default)]
struct InFlightKeys {
    active: HashSet<String>,
    finished: HashMap<String, DateTime<Utc>>,
}

impl InFlight {
    fn lock(&self) -> MutexGuard<'_, InFlightKeys> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns false if `key` is in flight or finished and not yet settled
    pub(crate) fn claim(&self, key: &str) -> bool {
        let mut keys = self.lock();
        if keys.finished.contains_key(key) {
            return false;
        }
        keys.active.insert(key.to_string())
    }

    /// Give `key` up without recording it; the next poll may schedule it again
    pub(crate) fn release(&self, key: &str) {
        self.lock().active.remove(key);
    }

    /// `key` was delivered and recorded in the state store
    pub(crate) fn finish(&self, key: &str) {
        let mut keys = self.lock();
        keys.active.remove(key);
        keys.finished.insert(key.to_string(), Utc::now());
    }

    /// Forget finished keys that `processed` already holds or that finished
    /// before `cutoff`
    pub(crate) fn settle(&self, processed: &ProcessedObjects, cutoff: DateTime<Utc>) {
        self.lock()
            .finished
            .retain(|key, finished_at| !processed.contains_key(key) && *finished_at >= cutoff);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().active.len()
    }

    #[cfg(test)]
    pub(crate) fn finished_len(&self) -> usize {
        self.lock().finished.len()
    }
}

pub struct Downloader {
    source: Arc<dyn ObjectSource>,
    store: Arc<dyn LogStore>,
    stater: Arc<dyn Stater>,
    limiter: ConcurrencyLimiter,
    settings: DownloaderSettings,
    metrics: Arc<Metrics>,
    in_flight: InFlight,
}

impl Downloader {
    pub fn new(
        source: Arc<dyn ObjectSource>,
        store: Arc<dyn LogStore>,
        stater: Arc<dyn Stater>,
        limiter: ConcurrencyLimiter,
        settings: DownloaderSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            source,
            store,
            stater,
            limiter,
            settings,
            metrics,
            in_flight: InFlight::default(),
        }
    }

    pub fn identifier(&self) -> &str {
        self.source.identifier()
    }

    pub fn settings(&self) -> &DownloaderSettings {
        &self.settings
    }

    /// Poll and download until `cancel` fires or listing fails permanently.
    ///
    /// Workers are stopped through a child token, so a fatal poll error does
    /// not leave them running.
    pub async fn run(
        self,
        out: mpsc::Sender<DownloadedObject>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let downloader = Arc::new(self);
        let workers_cancel = cancel.child_token();

        let (dispatcher, receivers) =
            WorkDispatcher::new(downloader.settings.workers, downloader.settings.queue_size);

        let mut workers = JoinSet::new();
        for (worker_id, rx) in receivers.into_iter().enumerate() {
            workers.spawn(worker::run_worker(
                worker_id,
                downloader.clone(),
                rx,
                out.clone(),
                workers_cancel.clone(),
            ));
        }
        drop(out);

        info!(
            entity = downloader.identifier(),
            bucket = downloader.source.bucket(),
            workers = dispatcher.num_workers(),
            poll_interval_secs = downloader.settings.poll_interval.as_secs(),
            mark_policy = ?downloader.settings.mark_policy,
            "Downloader started"
        );

        let result = downloader.poll_loop(&dispatcher, &cancel).await;

        workers_cancel.cancel();
        drop(dispatcher);
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!(entity = downloader.identifier(), error = %e, "Download worker panicked");
            }
        }

        info!(entity = downloader.identifier(), ok = result.is_ok(), "Downloader stopped");
        result
    }
}
