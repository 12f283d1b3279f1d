//! Download worker: pulls candidates from its channel and fetches them

use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::broker::Candidate;
use super::{DownloadedObject, Downloader, MarkPolicy};

pub(super) async fn run_worker(
    worker_id: usize,
    downloader: Arc<Downloader>,
    mut rx: mpsc::Receiver<Candidate>,
    out: mpsc::Sender<DownloadedObject>,
    cancel: CancellationToken,
) {
    debug!(worker_id, entity = downloader.identifier(), "Download worker started");

    loop {
        let candidate = tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(candidate) => candidate,
                None => break,
            },
        };

        let key = candidate.key.clone();
        if downloader.process(worker_id, candidate, &out, &cancel).await {
            downloader.in_flight.finish(&key);
        } else {
            downloader.in_flight.release(&key);
        }
    }

    debug!(worker_id, entity = downloader.identifier(), "Download worker stopped");
}

impl Downloader {
    /// Fetch one object and hand it to the consumer. Returns true once the
    /// object is recorded as processed.
    async fn process(
        &self,
        worker_id: usize,
        candidate: Candidate,
        out: &mpsc::Sender<DownloadedObject>,
        cancel: &CancellationToken,
    ) -> bool {
        let marked_on_schedule = self.settings.mark_policy == MarkPolicy::BeforeDownload;
        let key = candidate.key;
        let bucket = self.source.bucket();

        let permit = tokio::select! {
            _ = cancel.cancelled() => return marked_on_schedule,
            permit = self.limiter.acquire() => match permit {
                Ok(permit) => permit,
                Err(e) => {
                    warn!(key = %key, error = %e, "Could not acquire download slot");
                    return marked_on_schedule;
                }
            },
        };

        let local_path = self
            .settings
            .temp_dir
            .join(format!("logbucket-{}", Uuid::new_v4()));

        let result = tokio::select! {
            _ = cancel.cancelled() => None,
            result = self.store.download_to(bucket, &key, &local_path) => Some(result),
        };
        permit.release();

        let bytes = match result {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                warn!(worker_id, bucket, key = %key, error = %e, "Download failed, abandoning object");
                self.metrics.download_failed(1);
                remove_partial(&local_path).await;
                return marked_on_schedule;
            }
            None => {
                debug!(key = %key, "Download cancelled");
                remove_partial(&local_path).await;
                return marked_on_schedule;
            }
        };

        self.metrics.object_downloaded(1);
        info!(
            worker_id,
            bucket,
            key = %key,
            bytes,
            size = candidate.size,
            "Downloaded object"
        );

        let downloaded = DownloadedObject {
            object_key: key.clone(),
            local_path: local_path.clone(),
        };

        let delivered = tokio::select! {
            _ = cancel.cancelled() => false,
            sent = out.send(downloaded) => sent.is_ok(),
        };

        if !delivered {
            debug!(key = %key, "Consumer gone, discarding download");
            remove_partial(&local_path).await;
            return marked_on_schedule;
        }

        if marked_on_schedule {
            return true;
        }

        match self.stater.mark_processed(&key).await {
            Ok(()) => true,
            Err(e) => {
                warn!(key = %key, error = %e, "Could not mark object as processed");
                self.metrics.state_write_failed(1);
                false
            }
        }
    }
}

/// Best-effort removal of a temp file this worker still owns
async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Could not remove temp file"),
    }
}
