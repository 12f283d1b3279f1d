use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::Arc;

use flate2::read::MultiGzDecoder;
use tracing::{debug, info, warn};

use super::error::Result;
use super::parsers::{EventParser, Parsed};
use super::sampler::Sampler;
use super::sink::EventSink;
use crate::downloader::DownloadedObject;
use crate::observability::Metrics;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// What happened to one object
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishSummary {
    pub parsed: usize,
    pub sent: usize,
    pub dropped: usize,
    pub malformed: usize,
}

/// Consumer side of the pipeline: parse, sample, send, clean up
pub struct ObjectPublisher {
    parser: Arc<dyn EventParser>,
    sampler: Arc<dyn Sampler>,
    sink: Arc<dyn EventSink>,
    metrics: Arc<Metrics>,
}

impl ObjectPublisher {
    pub fn new(
        parser: Arc<dyn EventParser>,
        sampler: Arc<dyn Sampler>,
        sink: Arc<dyn EventSink>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            parser,
            sampler,
            sink,
            metrics,
        }
    }

    /// Publish `object` and delete its temp file, whatever the outcome
    pub async fn publish(&self, object: DownloadedObject) -> Result<PublishSummary> {
        let result = self.publish_file(&object).await;

        if let Err(e) = tokio::fs::remove_file(&object.local_path).await {
            warn!(path = %object.local_path.display(), error = %e, "Could not remove downloaded object");
        }

        match &result {
            Ok(summary) => info!(
                key = %object.object_key,
                parsed = summary.parsed,
                sent = summary.sent,
                dropped = summary.dropped,
                malformed = summary.malformed,
                "Published object"
            ),
            Err(e) => warn!(key = %object.object_key, error = %e, "Publishing object failed"),
        }
        result
    }

    async fn publish_file(&self, object: &DownloadedObject) -> Result<PublishSummary> {
        let parser = self.parser.clone();
        let path = object.local_path.clone();

        // Decompression and parsing are CPU bound
        let parsed = tokio::task::spawn_blocking(move || parse_file(parser.as_ref(), &path)).await??;

        let mut summary = PublishSummary {
            parsed: parsed.events.len(),
            malformed: parsed.malformed,
            ..Default::default()
        };
        self.metrics.events_parsed(summary.parsed as u64);

        let mut kept = Vec::with_capacity(parsed.events.len());
        for mut event in parsed.events {
            let key = self.parser.sample_key(&event);
            let rate = self.sampler.sample_rate(&key).max(1);
            if rate == 1 || rand::random_range(0..rate) == 0 {
                event.sample_rate = rate;
                kept.push(event);
            }
        }
        summary.sent = kept.len();
        summary.dropped = summary.parsed - summary.sent;
        self.metrics.events_dropped(summary.dropped as u64);

        if !kept.is_empty() {
            self.sink.send(&kept).await?;
            self.metrics.events_sent(summary.sent as u64);
        }

        debug!(key = %object.object_key, service = %self.parser.service(), "Object events handled");
        Ok(summary)
    }
}

/// Open `path`, gunzipping when it starts with the gzip magic bytes
fn parse_file(parser: &dyn EventParser, path: &Path) -> Result<Parsed> {
    let mut file = std::fs::File::open(path)?;
    let mut magic = [0u8; 2];
    let read = file.read(&mut magic)?;

    let head = std::io::Cursor::new(magic[..read].to_vec());
    let chained = head.chain(file);

    if read == 2 && magic == GZIP_MAGIC {
        let mut reader = BufReader::new(MultiGzDecoder::new(chained));
        parser.parse(&mut reader)
    } else {
        let mut reader = BufReader::new(chained);
        parser.parse(&mut reader)
    }
}
