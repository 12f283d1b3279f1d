use clap::{Parser, Subcommand};
use std::path::PathBuf;

use logbucket::config::Config;
use logbucket::source::ServiceKind;

#[derive(Parser, Debug)]
#[command(name = "logbucket")]
#[command(about = "Ingest AWS access logs from S3 into an event store", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Service whose logs are handled: elb, alb, cloudfront or cloudtrail
    #[arg(long, short = 's', global = true, default_value = "alb")]
    pub service: ServiceKind,

    #[command(flatten)]
    pub overrides: Overrides,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List the configured entities of the service
    #[command(visible_alias = "list")]
    Ls(SelectArgs),

    /// Poll entity buckets and send their log events until interrupted
    Ingest(SelectArgs),
}

#[derive(clap::Args, Debug)]
pub struct SelectArgs {
    /// Only entities whose name matches one of these regular expressions
    pub entities: Vec<String>,
}

/// Flags that win over the configuration file and environment
#[derive(clap::Args, Debug, Default)]
pub struct Overrides {
    /// Configuration file (default: $LOGBUCKET_CONFIG or config/logbucket.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Team write key for the event API
    #[arg(long, global = true, env = "LOGBUCKET_WRITE_KEY", hide_env_values = true)]
    pub write_key: Option<String>,

    /// Dataset to send events to (default depends on the service)
    #[arg(long, global = true)]
    pub dataset: Option<String>,

    /// Directory holding the processed-object state file
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Ignore objects older than this many hours (1-168)
    #[arg(long, global = true)]
    pub backfill_hours: Option<u32>,

    /// Keep state in the shared table so several instances can run at once
    #[arg(long, global = true)]
    pub high_availability: bool,

    /// Maximum simultaneous downloads across all entities
    #[arg(long, global = true)]
    pub concurrency: Option<usize>,

    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(long, global = true)]
    pub debug: bool,
}

impl Overrides {
    pub fn apply(&self, config: &mut Config) {
        if let Some(key) = self.write_key.as_ref().filter(|k| !k.is_empty()) {
            config.telemetry.write_key = Some(key.clone());
        }
        if let Some(dataset) = &self.dataset {
            config.telemetry.dataset = Some(dataset.clone());
        }
        if let Some(dir) = &self.state_dir {
            config.ingest.state_dir = dir.clone();
        }
        if let Some(hours) = self.backfill_hours {
            config.ingest.backfill_hours = hours;
        }
        if self.high_availability {
            config.ingest.high_availability = true;
        }
        if self.concurrency.is_some() {
            config.ingest.concurrency = self.concurrency;
        }
    }
}
