//! Log sources: where each watched entity writes its log objects
//!
//! Every entity (one load balancer, one distribution, one trail) knows its
//! bucket and how to build the key prefix of the objects written on a given
//! UTC day. The four supported services are a closed set, modeled by
//! [`LogSource`]; the pipeline only sees the [`ObjectSource`] capability.

mod cloudfront;
mod cloudtrail;
mod elb;

pub use cloudfront::CloudFrontSource;
pub use cloudtrail::CloudTrailSource;
pub use elb::{AlbSource, ElbSource};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Capability the download pipeline needs from an entity
pub trait ObjectSource: Send + Sync {
    /// Key prefix for objects written on `day` (UTC)
    fn object_prefix(&self, day: NaiveDate) -> String;

    /// Bucket the entity delivers its logs to
    fn bucket(&self) -> &str;

    /// Human-readable entity name, used in logs
    fn identifier(&self) -> &str;
}

/// Supported log-producing services
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Elb,
    Alb,
    CloudFront,
    CloudTrail,
}

impl ServiceKind {
    /// Service name used for state file naming
    pub fn state_name(&self) -> &'static str {
        match self {
            ServiceKind::Elb => "elasticloadbalancing",
            ServiceKind::Alb => "elasticloadbalancingv2",
            ServiceKind::CloudFront => "cloudfront",
            ServiceKind::CloudTrail => "cloudtrail",
        }
    }

    /// Default telemetry dataset for this service
    pub fn default_dataset(&self) -> &'static str {
        match self {
            ServiceKind::Elb => "aws-elb-access",
            ServiceKind::Alb => "aws-alb-access",
            ServiceKind::CloudFront => "aws-cloudfront-access",
            ServiceKind::CloudTrail => "aws-cloudtrail",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Elb => "elb",
            ServiceKind::Alb => "alb",
            ServiceKind::CloudFront => "cloudfront",
            ServiceKind::CloudTrail => "cloudtrail",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown service '{0}', expected one of: elb, alb, cloudfront, cloudtrail")]
pub struct UnknownService(pub String);

impl FromStr for ServiceKind {
    type Err = UnknownService;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "elb" => Ok(ServiceKind::Elb),
            "alb" | "elbv2" => Ok(ServiceKind::Alb),
            "cloudfront" => Ok(ServiceKind::CloudFront),
            "cloudtrail" => Ok(ServiceKind::CloudTrail),
            _ => Err(UnknownService(s.to_string())),
        }
    }
}

/// One watched entity, fixed for the lifetime of its downloader
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSource {
    Elb(ElbSource),
    Alb(AlbSource),
    CloudFront(CloudFrontSource),
    CloudTrail(CloudTrailSource),
}

impl LogSource {
    pub fn kind(&self) -> ServiceKind {
        match self {
            LogSource::Elb(_) => ServiceKind::Elb,
            LogSource::Alb(_) => ServiceKind::Alb,
            LogSource::CloudFront(_) => ServiceKind::CloudFront,
            LogSource::CloudTrail(_) => ServiceKind::CloudTrail,
        }
    }

    fn inner(&self) -> &dyn ObjectSource {
        match self {
            LogSource::Elb(s) => s,
            LogSource::Alb(s) => s,
            LogSource::CloudFront(s) => s,
            LogSource::CloudTrail(s) => s,
        }
    }
}

impl ObjectSource for LogSource {
    fn object_prefix(&self, day: NaiveDate) -> String {
        self.inner().object_prefix(day)
    }

    fn bucket(&self) -> &str {
        self.inner().bucket()
    }

    fn identifier(&self) -> &str {
        self.inner().identifier()
    }
}

/// Normalize a user-supplied bucket prefix so it can be concatenated:
/// empty stays empty, anything else ends with exactly one `/`.
pub(crate) fn normalize_bucket_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}/", trimmed)
    }
}

/// `/YYYY/MM/DD` path component
pub(crate) fn day_path(day: NaiveDate) -> String {
    day.format("/%Y/%m/%d").to_string()
}
