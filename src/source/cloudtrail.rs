use chrono::NaiveDate;

use super::{ObjectSource, day_path, normalize_bucket_prefix};

const CLOUDTRAIL_SERVICE: &str = "CloudTrail";

/// CloudTrail trail logs, optionally delivered by an organization trail
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudTrailSource {
    pub account_id: String,
    pub region: String,
    pub bucket: String,
    pub bucket_prefix: String,
    pub trail_id: String,
    pub org_id: Option<String>,
}

impl CloudTrailSource {
    pub fn new(
        account_id: impl Into<String>,
        region: impl Into<String>,
        bucket: impl Into<String>,
        bucket_prefix: impl Into<String>,
        trail_id: impl Into<String>,
        org_id: Option<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            region: region.into(),
            bucket: bucket.into(),
            bucket_prefix: bucket_prefix.into(),
            trail_id: trail_id.into(),
            org_id: org_id.filter(|id| !id.is_empty()),
        }
    }
}

impl ObjectSource for CloudTrailSource {
    fn object_prefix(&self, day: NaiveDate) -> String {
        // Organization trails nest every member account under the org id
        let org = self
            .org_id
            .as_deref()
            .map(|id| format!("{}/", id))
            .unwrap_or_default();

        format!(
            "{prefix}AWSLogs/{org}{account}/{service}/{region}{day}/{account}_{service}_{region}",
            prefix = normalize_bucket_prefix(&self.bucket_prefix),
            org = org,
            account = self.account_id,
            service = CLOUDTRAIL_SERVICE,
            region = self.region,
            day = day_path(day),
        )
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn identifier(&self) -> &str {
        &self.trail_id
    }
}
