//! Turning downloaded log objects into telemetry events
//!
//! Each downloaded object is decompressed if needed, parsed by the service's
//! [`EventParser`], thinned out by a [`Sampler`], and sent through an
//! [`EventSink`] in batches. The temp file is deleted afterwards regardless
//! of the outcome.

pub mod error;
pub mod parsers;
pub mod publisher;
pub mod sampler;
pub mod sink;

pub use error::{PublishError, Result};
pub use parsers::{EventParser, Parsed, parser_for};
pub use publisher::{ObjectPublisher, PublishSummary};
pub use sampler::{AvgSampleRate, Sampler, SamplerKind, StaticSampler};
pub use sink::{EventSink, HttpSink, MemorySink, SinkConfig};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

/// One telemetry event, serialized in the batch API's shape
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    #[serde(rename = "time")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "samplerate")]
    pub sample_rate: u32,
    pub data: Map<String, Value>,
}

impl Event {
    pub fn new(timestamp: DateTime<Utc>, data: Map<String, Value>) -> Self {
        Self {
            timestamp,
            sample_rate: 1,
            data,
        }
    }

    /// String form of a field, numbers included
    pub fn field_str(&self, name: &str) -> Option<String> {
        match self.data.get(name)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}
