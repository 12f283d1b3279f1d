use std::io::BufRead;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::debug;

use super::{EventParser, FieldKind, Parsed, drop_negative_times, shape_request, split_fields, typed_value};
use crate::publish::Event;
use crate::publish::error::Result;
use crate::source::ServiceKind;

use FieldKind::{Float, Int, Text, Timestamp};

/// Classic load balancer access log layout
pub const ELB_FIELDS: &[(&str, FieldKind)] = &[
    ("timestamp", Timestamp),
    ("elb", Text),
    ("client_authority", Text),
    ("backend_authority", Text),
    ("request_processing_time", Float),
    ("backend_processing_time", Float),
    ("response_processing_time", Float),
    ("elb_status_code", Int),
    ("backend_status_code", Int),
    ("received_bytes", Int),
    ("sent_bytes", Int),
    ("request", Text),
    ("user_agent", Text),
    ("ssl_cipher", Text),
    ("ssl_protocol", Text),
];

/// Application load balancer layout: a leading `type`, then the classic
/// fields, then the ALB additions
pub const ALB_FIELDS: &[(&str, FieldKind)] = &[
    ("type", Text),
    ("timestamp", Timestamp),
    ("elb", Text),
    ("client_authority", Text),
    ("backend_authority", Text),
    ("request_processing_time", Float),
    ("backend_processing_time", Float),
    ("response_processing_time", Float),
    ("elb_status_code", Int),
    ("backend_status_code", Int),
    ("received_bytes", Int),
    ("sent_bytes", Int),
    ("request", Text),
    ("user_agent", Text),
    ("ssl_cipher", Text),
    ("ssl_protocol", Text),
    ("target_group_arn", Text),
    ("trace_id", Text),
    ("domain_name", Text),
    ("chosen_cert_arn", Text),
    ("matched_rule_priority", Int),
    ("request_creation_time", Text),
];

/// Space-separated ELB/ALB access logs
pub struct LoadBalancerParser {
    kind: ServiceKind,
    fields: &'static [(&'static str, FieldKind)],
    /// Lines shorter than this are malformed; ALB logs grow new trailing
    /// fields over time, so only the leading ones are required
    required: usize,
}

impl LoadBalancerParser {
    pub fn classic() -> Self {
        Self {
            kind: ServiceKind::Elb,
            fields: ELB_FIELDS,
            required: ELB_FIELDS.len(),
        }
    }

    pub fn application() -> Self {
        Self {
            kind: ServiceKind::Alb,
            fields: ALB_FIELDS,
            required: 20,
        }
    }

    fn parse_line(&self, line: &str) -> Option<Event> {
        let values = split_fields(line);
        if values.len() < self.required {
            return None;
        }

        let mut timestamp: Option<DateTime<Utc>> = None;
        let mut data = Map::new();

        for ((name, kind), raw) in self.fields.iter().zip(values.iter()) {
            if *kind == Timestamp {
                timestamp = DateTime::parse_from_rfc3339(raw)
                    .ok()
                    .map(|t| t.with_timezone(&Utc));
                continue;
            }
            if let Some(value) = typed_value(*kind, raw) {
                data.insert((*name).to_string(), value);
            }
        }

        let timestamp = timestamp?;

        if let Some(duration_ms) = request_duration_ms(&data, timestamp) {
            data.insert("duration_ms".to_string(), Value::from(duration_ms));
        }

        drop_negative_times(&mut data);
        shape_request(&mut data, "request");

        Some(Event::new(timestamp, data))
    }
}

/// Milliseconds between the ALB receiving the request and writing the entry
fn request_duration_ms(data: &Map<String, Value>, timestamp: DateTime<Utc>) -> Option<f64> {
    let created = data.get("request_creation_time")?.as_str()?;
    let created = DateTime::parse_from_rfc3339(created).ok()?.with_timezone(&Utc);
    let micros = timestamp.signed_duration_since(created).num_microseconds()?;
    Some(micros as f64 / 1000.0)
}

impl EventParser for LoadBalancerParser {
    fn service(&self) -> ServiceKind {
        self.kind
    }

    fn parse(&self, reader: &mut dyn BufRead) -> Result<Parsed> {
        let mut parsed = Parsed::default();

        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            match self.parse_line(line) {
                Some(event) => parsed.events.push(event),
                None => {
                    parsed.malformed += 1;
                    debug!(service = %self.kind, line, "Skipping malformed log line");
                }
            }
        }

        Ok(parsed)
    }

    /// `{backend_status}_{elb_status}_{elb}`, so each load balancer and
    /// status pair gets its own rate
    fn sample_key(&self, event: &Event) -> String {
        let backend = event
            .data
            .get("backend_status_code")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let elb_status = event
            .data
            .get("elb_status_code")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let elb = event.field_str("elb").unwrap_or_default();
        format!("{}_{}_{}", backend, elb_status, elb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ELB_LINE: &str = r#"2017-07-31T20:30:57.975041Z spline_reticulation_lb 10.11.12.13:47882 10.3.47.87:8080 0.000021 0.010962 -1 504 504 766 17 "PUT https://api.simulation.io:443/reticulate/spline/1 HTTP/1.1" "libhoney-go/1.3.3" ECDHE-RSA-AES128-GCM-SHA256 TLSv1.2"#;

    const ALB_LINE: &str = r#"h2 2017-07-31T20:30:57.975041Z spline_reticulation_lb 10.11.12.13:47882 10.3.47.87:8080 0.000021 0.010962 -1 504 504 766 17 "PUT https://api.simulation.io:443/reticulate/spline/1 HTTP/1.1" "libhoney-go/1.3.3" ECDHE-RSA-AES128-GCM-SHA256 TLSv1.2 groupARN "Root=1-5e71404d-84277a47a826ab3d2e844170" "ui-dogfood.honeycomb.io" "certARN" 0 2017-07-31T20:30:52.975041Z "forward" "-" "-" "10.11.12.13:80" "201""#;

    fn parse_one(parser: &LoadBalancerParser, line: &str) -> Event {
        let mut reader = line.as_bytes();
        let mut parsed = parser.parse(&mut reader).unwrap();
        assert_eq!(parsed.events.len(), 1);
        parsed.events.remove(0)
    }

    #[test]
    fn test_classic_line() {
        let event = parse_one(&LoadBalancerParser::classic(), ELB_LINE);

        assert_eq!(event.timestamp.to_rfc3339(), "2017-07-31T20:30:57.975041+00:00");
        assert_eq!(event.data["elb"], "spline_reticulation_lb");
        assert_eq!(event.data["client_authority"], "10.11.12.13:47882");
        assert_eq!(event.data["request_processing_time"], json!(0.000021));
        assert_eq!(event.data["backend_status_code"], 504);
        assert_eq!(event.data["received_bytes"], 766);
        assert_eq!(event.data["sent_bytes"], 17);
        assert_eq!(event.data["user_agent"], "libhoney-go/1.3.3");
        assert_eq!(event.data["ssl_protocol"], "TLSv1.2");
        assert_eq!(event.data["request_method"], "PUT");
        assert!(!event.data.contains_key("timestamp"));
        // -1 means the backend never answered
        assert!(!event.data.contains_key("response_processing_time"));
    }

    #[test]
    fn test_application_line() {
        let event = parse_one(&LoadBalancerParser::application(), ALB_LINE);

        assert_eq!(event.data["type"], "h2");
        assert_eq!(event.data["target_group_arn"], "groupARN");
        assert_eq!(event.data["trace_id"], "Root=1-5e71404d-84277a47a826ab3d2e844170");
        assert_eq!(event.data["domain_name"], "ui-dogfood.honeycomb.io");
        assert_eq!(event.data["chosen_cert_arn"], "certARN");
        assert_eq!(event.data["matched_rule_priority"], 0);
        assert_eq!(event.data["request_creation_time"], "2017-07-31T20:30:52.975041Z");
        assert_eq!(event.data["duration_ms"], json!(5000.0));
    }

    #[test]
    fn test_sample_key() {
        let parser = LoadBalancerParser::application();
        let event = parse_one(&parser, ALB_LINE);
        assert_eq!(parser.sample_key(&event), "504_504_spline_reticulation_lb");
    }

    #[test]
    fn test_malformed_lines_are_counted() {
        let input = format!("{}\ngarbage line\n\n# comment\n", ELB_LINE);
        let mut reader = input.as_bytes();
        let parsed = LoadBalancerParser::classic().parse(&mut reader).unwrap();

        assert_eq!(parsed.events.len(), 1);
        assert_eq!(parsed.malformed, 1);
    }
}
