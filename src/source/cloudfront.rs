use chrono::NaiveDate;

use super::{ObjectSource, normalize_bucket_prefix};

/// CloudFront distribution access logs
///
/// Objects are named `{prefix}{distribution}.{YYYY-MM-DD-HH}.{unique}.gz`,
/// so the day prefix stops at the date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudFrontSource {
    pub bucket: String,
    pub bucket_prefix: String,
    pub distribution_id: String,
}

impl CloudFrontSource {
    pub fn new(
        bucket: impl Into<String>,
        bucket_prefix: impl Into<String>,
        distribution_id: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            bucket_prefix: bucket_prefix.into(),
            distribution_id: distribution_id.into(),
        }
    }
}

impl ObjectSource for CloudFrontSource {
    fn object_prefix(&self, day: NaiveDate) -> String {
        format!(
            "{}{}.{}",
            normalize_bucket_prefix(&self.bucket_prefix),
            self.distribution_id,
            day.format("%Y-%m-%d")
        )
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn identifier(&self) -> &str {
        &self.distribution_id
    }
}
