use chrono::NaiveDate;

use super::{ObjectSource, day_path, normalize_bucket_prefix};

/// Service path component shared by classic and application load balancers
const ELB_SERVICE: &str = "elasticloadbalancing";

/// Classic load balancer access logs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElbSource {
    pub account_id: String,
    pub region: String,
    pub bucket: String,
    pub bucket_prefix: String,
    pub lb_name: String,
}

impl ElbSource {
    pub fn new(
        account_id: impl Into<String>,
        region: impl Into<String>,
        bucket: impl Into<String>,
        bucket_prefix: impl Into<String>,
        lb_name: impl Into<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            region: region.into(),
            bucket: bucket.into(),
            bucket_prefix: bucket_prefix.into(),
            lb_name: lb_name.into(),
        }
    }

    /// Prefix with an arbitrary entity component, so ALB can reuse the layout
    pub(crate) fn prefix_for(&self, day: NaiveDate, entity: &str) -> String {
        format!(
            "{prefix}AWSLogs/{account}/{service}/{region}{day}/{account}_{service}_{region}_{entity}",
            prefix = normalize_bucket_prefix(&self.bucket_prefix),
            account = self.account_id,
            service = ELB_SERVICE,
            region = self.region,
            day = day_path(day),
            entity = entity,
        )
    }
}

impl ObjectSource for ElbSource {
    fn object_prefix(&self, day: NaiveDate) -> String {
        self.prefix_for(day, &self.lb_name)
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn identifier(&self) -> &str {
        &self.lb_name
    }
}

/// Application load balancer access logs
///
/// Same layout as classic load balancers, except that the entity component
/// carries an `app.` marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlbSource {
    elb: ElbSource,
}

impl AlbSource {
    pub fn new(elb: ElbSource) -> Self {
        Self { elb }
    }

    pub fn elb(&self) -> &ElbSource {
        &self.elb
    }
}

impl ObjectSource for AlbSource {
    fn object_prefix(&self, day: NaiveDate) -> String {
        let entity = format!("app.{}", self.elb.lb_name);
        self.elb.prefix_for(day, &entity)
    }

    fn bucket(&self) -> &str {
        self.elb.bucket()
    }

    fn identifier(&self) -> &str {
        self.elb.identifier()
    }
}
