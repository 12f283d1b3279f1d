//! Observability: tracing setup and in-process counters

use std::sync::atomic::{AtomicU64, Ordering};

use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` wins over `debug`.
pub fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // A second init (tests, embedding) keeps the first subscriber
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

macro_rules! counters {
    ($($name:ident => $method:ident),* $(,)?) => {
        /// Pipeline counters, shared by every downloader and the publisher
        #[derive(Debug, Default)]
        pub struct Metrics {
            $($name: AtomicU64,)*
        }

        impl Metrics {
            pub fn new() -> Self {
                Self::default()
            }

            $(
                pub fn $method(&self, n: u64) {
                    self.$name.fetch_add(n, Ordering::Relaxed);
                    tracing::debug!(counter = stringify!($name), n, "Metric incremented");
                }
            )*

            pub fn snapshot(&self) -> MetricsSnapshot {
                MetricsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }
        }

        #[derive(Debug, Clone, Default, PartialEq, Eq)]
        pub struct MetricsSnapshot {
            $(pub $name: u64,)*
        }
    };
}

counters! {
    objects_listed => objects_listed,
    skipped_processed => skipped_processed,
    skipped_stale => skipped_stale,
    objects_scheduled => object_scheduled,
    objects_downloaded => object_downloaded,
    downloads_failed => download_failed,
    state_write_failures => state_write_failed,
    events_parsed => events_parsed,
    events_sent => events_sent,
    events_dropped => events_dropped,
}

impl MetricsSnapshot {
    /// One-line summary for shutdown logging
    pub fn log_summary(&self) {
        tracing::info!(
            listed = self.objects_listed,
            scheduled = self.objects_scheduled,
            downloaded = self.objects_downloaded,
            failed = self.downloads_failed,
            skipped_processed = self.skipped_processed,
            skipped_stale = self.skipped_stale,
            state_write_failures = self.state_write_failures,
            events_parsed = self.events_parsed,
            events_sent = self.events_sent,
            events_dropped = self.events_dropped,
            "Pipeline totals"
        );
    }
}
