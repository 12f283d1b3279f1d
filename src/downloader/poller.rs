use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::broker::{Candidate, WorkDispatcher};
use super::error::{DownloadError, Result};
use super::{Downloader, MarkPolicy};
use crate::storage::{ObjectSummary, StorageError};

/// What one poll cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub listed: usize,
    pub scheduled: usize,
    pub skipped_processed: usize,
    pub skipped_stale: usize,
    /// Being downloaded, or finished but missing from this cycle's snapshot
    pub skipped_in_flight: usize,
}

impl Downloader {
    pub(super) async fn poll_loop(
        &self,
        dispatcher: &WorkDispatcher,
        cancel: &CancellationToken,
    ) -> Result<()> {
        // First tick completes immediately, so the first poll runs at startup
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(entity = self.identifier(), "Poll loop cancelled");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            match self.poll_once(dispatcher, cancel).await {
                Ok(summary) => {
                    info!(
                        entity = self.identifier(),
                        listed = summary.listed,
                        scheduled = summary.scheduled,
                        skipped_processed = summary.skipped_processed,
                        skipped_stale = summary.skipped_stale,
                        skipped_in_flight = summary.skipped_in_flight,
                        "Poll cycle complete"
                    );
                }
                Err(e @ DownloadError::Unrecoverable { .. }) => {
                    error!(entity = self.identifier(), error = %e, "Listing cannot succeed, stopping downloader");
                    return Err(e);
                }
                Err(DownloadError::OutputClosed) => {
                    info!(entity = self.identifier(), "Workers gone, stopping poll loop");
                    return Ok(());
                }
                Err(e) => {
                    warn!(entity = self.identifier(), error = %e, "Poll cycle aborted, retrying next tick");
                }
            }
        }
    }

    /// List today's objects and dispatch the ones that still need fetching
    pub async fn poll_once(
        &self,
        dispatcher: &WorkDispatcher,
        cancel: &CancellationToken,
    ) -> Result<PollSummary> {
        let now = Utc::now();
        let prefix = self.source.object_prefix(now.date_naive());

        let objects = self.list_all(&prefix, cancel).await?;
        let mut summary = PollSummary {
            listed: objects.len(),
            ..Default::default()
        };
        self.metrics.objects_listed(objects.len() as u64);

        let processed = match self.stater.list_processed().await {
            Ok(processed) => processed,
            Err(e) => {
                // Fail open: downloading twice beats never downloading
                warn!(entity = self.identifier(), error = %e, "Could not read processed objects, treating as empty");
                Default::default()
            }
        };

        let cutoff = now - self.settings.backfill;
        self.in_flight.settle(&processed, cutoff);

        for object in objects {
            if cancel.is_cancelled() {
                break;
            }

            if processed.contains_key(&object.key) {
                summary.skipped_processed += 1;
                continue;
            }

            if object.last_modified < cutoff {
                summary.skipped_stale += 1;
                continue;
            }

            if !self.in_flight.claim(&object.key) {
                summary.skipped_in_flight += 1;
                continue;
            }

            if self.settings.mark_policy == MarkPolicy::BeforeDownload {
                if let Err(e) = self.stater.mark_processed(&object.key).await {
                    warn!(key = %object.key, error = %e, "Could not mark object, skipping this cycle");
                    self.metrics.state_write_failed(1);
                    self.in_flight.release(&object.key);
                    continue;
                }
            }

            let key = object.key.clone();
            let candidate = Candidate {
                key: object.key,
                size: object.size,
                last_modified: object.last_modified,
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    self.in_flight.release(&key);
                    break;
                }
                sent = dispatcher.dispatch(candidate) => match sent {
                    Ok(worker_idx) => {
                        summary.scheduled += 1;
                        debug!(key = %key, worker_idx, "Scheduled download");
                    }
                    Err(_) => {
                        self.in_flight.release(&key);
                        return Err(DownloadError::OutputClosed);
                    }
                }
            }
        }

        self.metrics.skipped_processed(summary.skipped_processed as u64);
        self.metrics.skipped_stale(summary.skipped_stale as u64);
        self.metrics.object_scheduled(summary.scheduled as u64);

        Ok(summary)
    }

    /// Every object under `prefix`, newest first
    async fn list_all(&self, prefix: &str, cancel: &CancellationToken) -> Result<Vec<ObjectSummary>> {
        let bucket = self.source.bucket();
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let page = tokio::select! {
                _ = cancel.cancelled() => return Ok(Vec::new()),
                page = self.store.list_page(bucket, prefix, continuation.as_deref(), self.settings.page_size) => page,
            };

            let page = page.map_err(|e| {
                if e.is_unrecoverable() || matches!(e, StorageError::NotFound(_)) {
                    DownloadError::Unrecoverable {
                        bucket: bucket.to_string(),
                        prefix: prefix.to_string(),
                        source: e,
                    }
                } else {
                    DownloadError::Storage(e)
                }
            })?;

            pages += 1;
            objects.extend(page.objects);

            match page.next {
                Some(next) => continuation = Some(next),
                None => break,
            }
        }

        objects.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
        debug!(bucket, prefix, pages, objects = objects.len(), "Listed objects");
        Ok(objects)
    }
}
