use std::io::BufRead;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use super::{EventParser, Parsed};
use crate::publish::Event;
use crate::publish::error::{PublishError, Result};
use crate::source::ServiceKind;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct UserIdentity {
    #[serde(rename = "type")]
    kind: String,
    principal_id: String,
    arn: String,
    account_id: String,
    access_key_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrailRecord {
    #[serde(default)]
    user_identity: UserIdentity,
    event_time: String,
    #[serde(default)]
    event_source: String,
    #[serde(default)]
    event_name: String,
    #[serde(default)]
    aws_region: String,
    #[serde(rename = "sourceIPAddress", default)]
    source_ip_address: String,
    #[serde(default)]
    user_agent: String,
    #[serde(default)]
    event_type: String,
    #[serde(default)]
    request_parameters: Value,
}

#[derive(Debug, Deserialize)]
struct TrailDocument {
    #[serde(rename = "Records", default)]
    records: Vec<TrailRecord>,
}

impl TrailRecord {
    fn into_event(self) -> Option<Event> {
        let timestamp = DateTime::parse_from_rfc3339(&self.event_time)
            .ok()?
            .with_timezone(&Utc);

        let mut data = Map::new();
        data.insert("Type".to_string(), Value::from(self.user_identity.kind));
        data.insert("PrincipleId".to_string(), Value::from(self.user_identity.principal_id));
        data.insert("ARN".to_string(), Value::from(self.user_identity.arn));
        data.insert("AccountId".to_string(), Value::from(self.user_identity.account_id));
        data.insert("AccessKeyId".to_string(), Value::from(self.user_identity.access_key_id));
        data.insert("EventTime".to_string(), Value::from(self.event_time));
        data.insert("EventName".to_string(), Value::from(self.event_name));
        data.insert("EventSource".to_string(), Value::from(self.event_source));
        data.insert("AwsRegion".to_string(), Value::from(self.aws_region));
        data.insert("SourceIPAddress".to_string(), Value::from(self.source_ip_address));
        data.insert("UserAgent".to_string(), Value::from(self.user_agent));
        data.insert("EventType".to_string(), Value::from(self.event_type));
        data.insert("Parameters".to_string(), self.request_parameters);

        Some(Event::new(timestamp, data))
    }
}

/// CloudTrail delivery files: one JSON document with a `Records` array
pub struct CloudTrailParser;

impl EventParser for CloudTrailParser {
    fn service(&self) -> ServiceKind {
        ServiceKind::CloudTrail
    }

    fn parse(&self, reader: &mut dyn BufRead) -> Result<Parsed> {
        let document: TrailDocument = serde_json::from_reader(reader)
            .map_err(|e| PublishError::Malformed(format!("CloudTrail document: {}", e)))?;

        let mut parsed = Parsed::default();
        for record in document.records {
            let event_time = record.event_time.clone();
            match record.into_event() {
                Some(event) => parsed.events.push(event),
                None => {
                    parsed.malformed += 1;
                    debug!(event_time, "Skipping CloudTrail record with unparseable time");
                }
            }
        }
        Ok(parsed)
    }

    /// `{EventSource}_{EventName}`
    fn sample_key(&self, event: &Event) -> String {
        format!(
            "{}_{}",
            event.field_str("EventSource").unwrap_or_default(),
            event.field_str("EventName").unwrap_or_default()
        )
    }
}
