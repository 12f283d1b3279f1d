//! Processed-object tracking
//!
//! A [`Stater`] remembers which storage objects have already been scheduled
//! so that every poll cycle can skip them. Two backends exist:
//!
//! - [`FileStater`] keeps a JSON map `{ "<object key>": "<RFC3339 time>" }` in
//!   `{state_dir}/{service}-state.json`, guarded by an in-process mutex, and
//!   prunes records older than the backfill interval on every write.
//! - [`TableStater`] stores one record per object in a shared table through
//!   conditional inserts, so several cooperating processes can share the
//!   dedup state. Retention is left to the table's TTL.
//!
//! ## Retention
//!
//! Records are only interesting while the object they describe can still show
//! up in a listing that the poller would act on, i.e. while it is younger than
//! the backfill interval. Neither backend ever returns a record older than
//! that.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use logbucket::state::{FileStater, Stater};
//!
//! let stater = FileStater::new("/var/lib/logbucket", "elasticloadbalancingv2", backfill);
//! if !stater.list_processed().await?.contains_key(key) {
//!     stater.mark_processed(key).await?;
//! }
//! ```

pub mod dynamo;
pub mod error;
pub mod file;
pub mod table;

pub use dynamo::DynamoTable;
pub use error::{Result, StateError};
pub use file::{FileStater, legacy_state_files};
pub use table::{MemoryTable, ProcessedRecord, PutOutcome, RecordTable, TableStater};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Table name used by the high-availability backend
pub const DEFAULT_TABLE_NAME: &str = "HoneyAWSAccessLogBuckets";

/// Processed object keys mapped to the time they were marked
pub type ProcessedObjects = HashMap<String, DateTime<Utc>>;

/// Insight into which objects have already been handled
#[async_trait]
pub trait Stater: Send + Sync {
    /// Every tracked object still inside the backfill window
    async fn list_processed(&self) -> Result<ProcessedObjects>;

    /// Record that `object` has been handled. Marking twice is not an error.
    async fn mark_processed(&self, object: &str) -> Result<()>;
}

/// Whether a record marked at `marked_at` is still inside the window at `now`
pub(crate) fn within_window(
    marked_at: DateTime<Utc>,
    now: DateTime<Utc>,
    backfill: chrono::Duration,
) -> bool {
    now.signed_duration_since(marked_at) <= backfill
}
