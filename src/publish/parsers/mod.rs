//! Per-service log parsers

mod cloudfront;
mod cloudtrail;
mod elb;

pub use cloudfront::CloudFrontParser;
pub use cloudtrail::CloudTrailParser;
pub use elb::{ALB_FIELDS, ELB_FIELDS, LoadBalancerParser};

use std::io::BufRead;

use serde_json::{Map, Value};

use super::Event;
use super::error::Result;
use crate::source::ServiceKind;

/// Events parsed from one object, plus how many lines were unusable
#[derive(Debug, Default)]
pub struct Parsed {
    pub events: Vec<Event>,
    pub malformed: usize,
}

pub trait EventParser: Send + Sync {
    fn service(&self) -> ServiceKind;

    /// Parse a whole (decompressed) log object
    fn parse(&self, reader: &mut dyn BufRead) -> Result<Parsed>;

    /// Key grouping events for dynamic sampling
    fn sample_key(&self, event: &Event) -> String;
}

pub fn parser_for(kind: ServiceKind) -> Box<dyn EventParser> {
    match kind {
        ServiceKind::Elb => Box::new(LoadBalancerParser::classic()),
        ServiceKind::Alb => Box::new(LoadBalancerParser::application()),
        ServiceKind::CloudFront => Box::new(CloudFrontParser),
        ServiceKind::CloudTrail => Box::new(CloudTrailParser),
    }
}

/// How a raw field is typed in the event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Int,
    Float,
    /// Event time, not copied into the data
    Timestamp,
}

/// Split on whitespace, keeping double-quoted runs (with `\"` escapes)
/// together and unquoted
pub(crate) fn split_fields(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut quoted = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' if in_quotes => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '"' => {
                in_quotes = !in_quotes;
                quoted = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() || quoted {
                    fields.push(std::mem::take(&mut current));
                }
                quoted = false;
            }
            c => current.push(c),
        }
    }

    if !current.is_empty() || quoted {
        fields.push(current);
    }
    fields
}

/// Typed JSON value for `raw`, or `None` when it should be left out
pub(crate) fn typed_value(kind: FieldKind, raw: &str) -> Option<Value> {
    match kind {
        FieldKind::Text => Some(Value::String(raw.to_string())),
        FieldKind::Int => Some(
            raw.parse::<i64>()
                .map(Value::from)
                .unwrap_or_else(|_| Value::String(raw.to_string())),
        ),
        FieldKind::Float => Some(
            raw.parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(raw.to_string())),
        ),
        FieldKind::Timestamp => None,
    }
}

/// Negative processing times mean "no backend response"; they only skew
/// aggregates
pub(crate) fn drop_negative_times(data: &mut Map<String, Value>) {
    const TIME_FIELDS: [&str; 3] = [
        "request_processing_time",
        "backend_processing_time",
        "response_processing_time",
    ];

    for field in TIME_FIELDS {
        let negative = data
            .get(field)
            .and_then(Value::as_f64)
            .is_some_and(|t| t < 0.0);
        if negative {
            data.remove(field);
        }
    }
}

/// Break `METHOD URL PROTOCOL` into `{field}_method`, `{field}_uri`,
/// `{field}_path`, `{field}_query` and `{field}_protocol_version`
pub(crate) fn shape_request(data: &mut Map<String, Value>, field: &str) {
    let Some(request) = data.get(field).and_then(Value::as_str).map(str::to_string) else {
        return;
    };

    let parts: Vec<&str> = request.split(' ').collect();
    let target = if parts.len() == 3 {
        data.insert(format!("{}_method", field), Value::from(parts[0]));
        data.insert(format!("{}_protocol_version", field), Value::from(parts[2]));
        parts[1]
    } else {
        parts[0]
    };

    let (path, query) = match reqwest::Url::parse(target) {
        Ok(url) => (url.path().to_string(), url.query().map(str::to_string)),
        Err(_) => match target.split_once('?') {
            Some((path, query)) => (path.to_string(), Some(query.to_string())),
            None => (target.to_string(), None),
        },
    };

    let uri = match &query {
        Some(q) => format!("{}?{}", path, q),
        None => path.clone(),
    };

    data.insert(format!("{}_uri", field), Value::from(uri));
    data.insert(format!("{}_path", field), Value::from(path));
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        data.insert(format!("{}_query", field), Value::from(query));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_split_fields_with_quotes() {
        let fields = split_fields(r#"a b "GET http://x/ HTTP/1.1" "agent \"q\" 1" "" c"#);
        assert_eq!(
            fields,
            vec!["a", "b", "GET http://x/ HTTP/1.1", r#"agent "q" 1"#, "", "c"]
        );
    }

    #[test]
    fn test_typed_values() {
        assert_eq!(typed_value(FieldKind::Int, "504"), Some(json!(504)));
        assert_eq!(typed_value(FieldKind::Int, "-"), Some(json!("-")));
        assert_eq!(typed_value(FieldKind::Float, "0.000021"), Some(json!(0.000021)));
        assert_eq!(typed_value(FieldKind::Timestamp, "2018-01-01T00:00:00Z"), None);
    }

    #[test]
    fn test_drop_negative_times() {
        let mut data = Map::new();
        data.insert("response_processing_time".to_string(), json!(-1));
        data.insert("request_processing_time".to_string(), json!(-1.0));
        data.insert("backend_processing_time".to_string(), json!(0.01));

        drop_negative_times(&mut data);

        assert_eq!(data.len(), 1);
        assert!(data.contains_key("backend_processing_time"));
    }

    #[test]
    fn test_shape_request() {
        let mut data = Map::new();
        data.insert(
            "request".to_string(),
            json!("PUT https://api.simulation.io:443/reticulate/spline/1?x=2 HTTP/1.1"),
        );

        shape_request(&mut data, "request");

        assert_eq!(data["request_method"], "PUT");
        assert_eq!(data["request_protocol_version"], "HTTP/1.1");
        assert_eq!(data["request_path"], "/reticulate/spline/1");
        assert_eq!(data["request_query"], "x=2");
        assert_eq!(data["request_uri"], "/reticulate/spline/1?x=2");
    }

    #[test]
    fn test_shape_bare_path() {
        let mut data = Map::new();
        data.insert("request".to_string(), json!("/health"));

        shape_request(&mut data, "request");

        assert_eq!(data["request_path"], "/health");
        assert!(!data.contains_key("request_method"));
        assert!(!data.contains_key("request_query"));
    }
}
