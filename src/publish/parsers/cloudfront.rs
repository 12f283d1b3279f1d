use std::io::BufRead;

use chrono::NaiveDateTime;
use serde_json::Map;
use tracing::debug;

use super::{EventParser, FieldKind, Parsed, typed_value};
use crate::publish::Event;
use crate::publish::error::Result;
use crate::source::ServiceKind;

/// Field order used when an object carries no `#Fields:` header
const DEFAULT_FIELDS: &[&str] = &[
    "date",
    "time",
    "x-edge-location",
    "sc-bytes",
    "c-ip",
    "cs-method",
    "cs(Host)",
    "cs-uri-stem",
    "sc-status",
    "cs(Referer)",
    "cs(User-Agent)",
    "cs-uri-query",
    "cs(Cookie)",
    "x-edge-result-type",
    "x-edge-request-id",
    "x-host-header",
    "cs-protocol",
    "cs-bytes",
    "time-taken",
    "x-forwarded-for",
    "ssl-protocol",
    "ssl-cipher",
    "x-edge-response-result-type",
    "cs-protocol-version",
];

fn field_kind(name: &str) -> FieldKind {
    match name {
        "sc-status" | "sc-bytes" | "cs-bytes" => FieldKind::Int,
        "time-taken" => FieldKind::Float,
        _ => FieldKind::Text,
    }
}

/// CloudFront web distribution logs (W3C extended, tab separated)
pub struct CloudFrontParser;

impl CloudFrontParser {
    fn parse_line(fields: &[String], line: &str) -> Option<Event> {
        let values: Vec<&str> = line.split('\t').collect();
        if values.len() < 2 {
            return None;
        }

        let mut date = None;
        let mut time = None;
        let mut data = Map::new();

        for (name, raw) in fields.iter().zip(values.iter()) {
            match name.as_str() {
                "date" => date = Some(*raw),
                "time" => time = Some(*raw),
                // W3C marks missing values with a dash
                _ if *raw == "-" => {}
                _ => {
                    if let Some(value) = typed_value(field_kind(name), raw) {
                        data.insert(name.clone(), value);
                    }
                }
            }
        }

        let timestamp = NaiveDateTime::parse_from_str(
            &format!("{}T{}", date?, time?),
            "%Y-%m-%dT%H:%M:%S",
        )
        .ok()?
        .and_utc();

        Some(Event::new(timestamp, data))
    }
}

impl EventParser for CloudFrontParser {
    fn service(&self) -> ServiceKind {
        ServiceKind::CloudFront
    }

    fn parse(&self, reader: &mut dyn BufRead) -> Result<Parsed> {
        let mut fields: Vec<String> = DEFAULT_FIELDS.iter().map(|f| f.to_string()).collect();
        let mut parsed = Parsed::default();

        for line in reader.lines() {
            let line = line?;
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                continue;
            }
            if let Some(header) = line.strip_prefix("#Fields:") {
                fields = header.split_whitespace().map(str::to_string).collect();
                continue;
            }
            if line.starts_with('#') {
                continue;
            }

            match Self::parse_line(&fields, line) {
                Some(event) => parsed.events.push(event),
                None => {
                    parsed.malformed += 1;
                    debug!(line, "Skipping malformed CloudFront line");
                }
            }
        }

        Ok(parsed)
    }

    /// `{sc-status}_{cs(Host)}_{x-edge-result-type}`
    fn sample_key(&self, event: &Event) -> String {
        let status = event.field_str("sc-status").unwrap_or_else(|| "0".to_string());
        let host = event.field_str("cs(Host)").unwrap_or_default();
        let result = event.field_str("x-edge-result-type").unwrap_or_default();
        format!("{}_{}_{}", status, host, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOG: &str = "#Version: 1.0\n\
#Fields: date time x-edge-location sc-bytes c-ip cs-method cs(Host) cs-uri-stem sc-status cs(Referer) cs(User-Agent) cs-uri-query cs(Cookie) x-edge-result-type x-edge-request-id x-host-header cs-protocol cs-bytes time-taken\n\
2014-05-23\t01:13:11\tFRA2\t182\t192.0.2.10\tGET\td111111abcdef8.cloudfront.net\t/view/my/file.html\t200\twww.displaymyfiles.com\tMozilla/4.0%20(compatible;%20MSIE%205.0b1;%20Mac_PowerPC)\t-\tzip=98101\tRefreshHit\tMRVMF7KydIvxMWfJIglgwHQwZsbG2IhRJ07sn9AkKUFSHS9EXAMPLE==\td111111abcdef8.cloudfront.net\thttp\t-\t0.001\n";

    #[test]
    fn test_parse_with_header() {
        let mut reader = LOG.as_bytes();
        let parsed = CloudFrontParser.parse(&mut reader).unwrap();

        assert_eq!(parsed.events.len(), 1);
        assert_eq!(parsed.malformed, 0);

        let event = &parsed.events[0];
        assert_eq!(event.timestamp.to_rfc3339(), "2014-05-23T01:13:11+00:00");
        assert_eq!(event.data["sc-status"], 200);
        assert_eq!(event.data["sc-bytes"], 182);
        assert_eq!(event.data["cs(Host)"], "d111111abcdef8.cloudfront.net");
        assert_eq!(event.data["x-edge-result-type"], "RefreshHit");
        assert!(!event.data.contains_key("cs-uri-query"));
        assert!(!event.data.contains_key("date"));
    }

    #[test]
    fn test_sample_key() {
        let mut reader = LOG.as_bytes();
        let parsed = CloudFrontParser.parse(&mut reader).unwrap();
        assert_eq!(
            CloudFrontParser.sample_key(&parsed.events[0]),
            "200_d111111abcdef8.cloudfront.net_RefreshHit"
        );
    }

    #[test]
    fn test_bad_date_is_malformed() {
        let mut reader = "yesterday\tnoon\tFRA2\n".as_bytes();
        let parsed = CloudFrontParser.parse(&mut reader).unwrap();
        assert!(parsed.events.is_empty());
        assert_eq!(parsed.malformed, 1);
    }
}
