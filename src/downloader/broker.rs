use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// An object the poller decided to download
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Hands candidates from the poll loop to the worker pool
///
/// Round-robin over one bounded channel per worker. A full channel makes
/// `dispatch` wait, which in turn stalls the poll loop (backpressure).
pub struct WorkDispatcher {
    worker_channels: Vec<mpsc::Sender<Candidate>>,
    next_worker: AtomicUsize,
}

impl WorkDispatcher {
    /// Returns the dispatcher and one receiver per worker
    pub fn new(num_workers: usize, channel_size: usize) -> (Self, Vec<mpsc::Receiver<Candidate>>) {
        let num_workers = num_workers.max(1);
        let channel_size = channel_size.max(1);
        info!(num_workers, channel_size, "Creating download worker channels");

        let mut worker_channels = Vec::with_capacity(num_workers);
        let mut worker_receivers = Vec::with_capacity(num_workers);

        for worker_id in 0..num_workers {
            let (tx, rx) = mpsc::channel(channel_size);
            worker_channels.push(tx);
            worker_receivers.push(rx);
            debug!(worker_id, "Created worker channel");
        }

        let dispatcher = Self {
            worker_channels,
            next_worker: AtomicUsize::new(0),
        };

        (dispatcher, worker_receivers)
    }

    /// Send to the next worker. Gives the candidate back if that worker is gone.
    pub async fn dispatch(&self, candidate: Candidate) -> Result<usize, Candidate> {
        let worker_idx = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.worker_channels.len();

        match self.worker_channels[worker_idx].send(candidate).await {
            Ok(()) => Ok(worker_idx),
            Err(mpsc::error::SendError(candidate)) => {
                warn!(key = %candidate.key, worker_idx, "Worker channel closed, candidate not delivered");
                Err(candidate)
            }
        }
    }

    pub fn num_workers(&self) -> usize {
        self.worker_channels.len()
    }
}
