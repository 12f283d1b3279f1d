use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::error::{Result, StateError};
use super::{ProcessedObjects, Stater, within_window};

/// Lifetime of a record before the table expires it on its own
pub const RECORD_TTL_DAYS: i64 = 7;

/// One row of the shared state table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedRecord {
    /// Object key, the table's partition key
    pub object: String,
    pub time: DateTime<Utc>,
    /// Expiry as unix seconds
    pub ttl: i64,
}

impl ProcessedRecord {
    pub fn new(object: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self {
            object: object.into(),
            time,
            ttl: (time + chrono::Duration::days(RECORD_TTL_DAYS)).timestamp(),
        }
    }
}

/// Result of a conditional insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    AlreadyExists,
}

/// Minimal table capability the table-backed stater relies on
#[async_trait]
pub trait RecordTable: Send + Sync {
    fn name(&self) -> &str;

    /// Verify the table exists and is reachable
    async fn describe(&self) -> Result<()>;

    /// Insert `record` only if no record with the same object key exists
    async fn put_if_absent(&self, record: ProcessedRecord) -> Result<PutOutcome>;

    /// Every record marked at or after `since`, following scan pages
    async fn scan_since(&self, since: DateTime<Utc>) -> Result<Vec<ProcessedRecord>>;
}

/// Shared-table state for high-availability deployments
pub struct TableStater {
    table: Arc<dyn RecordTable>,
    backfill: chrono::Duration,
}

impl TableStater {
    /// Build a stater over `table`, refusing to start if it is unreachable
    pub async fn connect(table: Arc<dyn RecordTable>, backfill: chrono::Duration) -> Result<Self> {
        table.describe().await?;
        debug!(table = table.name(), "State table verified");
        Ok(Self { table, backfill })
    }
}

#[async_trait]
impl Stater for TableStater {
    async fn list_processed(&self) -> Result<ProcessedObjects> {
        let now = Utc::now();
        let records = self.table.scan_since(now - self.backfill).await?;

        // The table's TTL sweep is lazy, so re-check the window here
        Ok(records
            .into_iter()
            .filter(|r| within_window(r.time, now, self.backfill))
            .map(|r| (r.object, r.time))
            .collect())
    }

    async fn mark_processed(&self, object: &str) -> Result<()> {
        let record = ProcessedRecord::new(object, Utc::now());
        match self.table.put_if_absent(record).await {
            Ok(PutOutcome::Inserted) => Ok(()),
            Ok(PutOutcome::AlreadyExists) => {
                debug!(object, "Object already recorded by another writer");
                Ok(())
            }
            Err(e) => {
                warn!(object, table = self.table.name(), error = %e, "Conditional put failed");
                Err(e)
            }
        }
    }
}

/// In-process table with the same conditional-write and TTL semantics.
/// Useful for tests and single-host dry runs.
pub struct MemoryTable {
    name: String,
    rows: std::sync::Mutex<HashMap<String, ProcessedRecord>>,
}

impl MemoryTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn rows(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, ProcessedRecord>>> {
        self.rows.lock().map_err(|_| StateError::Table {
            table: self.name.clone(),
            message: "lock poisoned".to_string(),
        })
    }

    /// Insert a row unconditionally, e.g. to seed old records in tests
    pub fn insert_raw(&self, record: ProcessedRecord) -> Result<()> {
        self.rows()?.insert(record.object.clone(), record);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows().map(|rows| rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RecordTable for MemoryTable {
    fn name(&self) -> &str {
        &self.name
    }

    async fn describe(&self) -> Result<()> {
        Ok(())
    }

    async fn put_if_absent(&self, record: ProcessedRecord) -> Result<PutOutcome> {
        let mut rows = self.rows()?;
        if rows.contains_key(&record.object) {
            return Ok(PutOutcome::AlreadyExists);
        }
        rows.insert(record.object.clone(), record);
        Ok(PutOutcome::Inserted)
    }

    async fn scan_since(&self, since: DateTime<Utc>) -> Result<Vec<ProcessedRecord>> {
        let now = Utc::now().timestamp();
        let mut rows = self.rows()?;
        rows.retain(|_, r| r.ttl > now);
        Ok(rows.values().filter(|r| r.time >= since).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct UnreachableTable;

    #[async_trait]
    impl RecordTable for UnreachableTable {
        fn name(&self) -> &str {
            "missing"
        }

        async fn describe(&self) -> Result<()> {
            Err(StateError::Table {
                table: "missing".to_string(),
                message: "ResourceNotFoundException".to_string(),
            })
        }

        async fn put_if_absent(&self, _record: ProcessedRecord) -> Result<PutOutcome> {
            unreachable!()
        }

        async fn scan_since(&self, _since: DateTime<Utc>) -> Result<Vec<ProcessedRecord>> {
            unreachable!()
        }
    }

    async fn create_test_stater(table: Arc<MemoryTable>) -> TableStater {
        TableStater::connect(table, chrono::Duration::hours(1))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_connect_fails_without_table() {
        let result = TableStater::connect(Arc::new(UnreachableTable), chrono::Duration::hours(1)).await;
        assert!(matches!(result, Err(StateError::Table { .. })));
    }

    #[tokio::test]
    async fn test_mark_then_list() {
        let table = Arc::new(MemoryTable::new("state"));
        let stater = create_test_stater(table.clone()).await;

        stater.mark_processed("a").await.unwrap();
        stater.mark_processed("b").await.unwrap();

        let processed = stater.list_processed().await.unwrap();
        assert_eq!(processed.len(), 2);
        assert!(processed.contains_key("a"));
    }

    #[tokio::test]
    async fn test_duplicate_mark_is_success() {
        let table = Arc::new(MemoryTable::new("state"));
        let stater = create_test_stater(table.clone()).await;

        stater.mark_processed("a").await.unwrap();
        let first = stater.list_processed().await.unwrap()["a"];

        stater.mark_processed("a").await.unwrap();
        let second = stater.list_processed().await.unwrap()["a"];

        // The conditional insert keeps the original record
        assert_eq!(first, second);
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_list_excludes_records_outside_window() {
        let table = Arc::new(MemoryTable::new("state"));
        let stater = create_test_stater(table.clone()).await;

        let old = Utc::now() - chrono::Duration::hours(2);
        table.insert_raw(ProcessedRecord::new("old", old)).unwrap();
        stater.mark_processed("fresh").await.unwrap();

        let processed = stater.list_processed().await.unwrap();
        assert_eq!(processed.len(), 1);
        assert!(processed.contains_key("fresh"));
    }

    #[tokio::test]
    async fn test_memory_table_expires_by_ttl() {
        let table = MemoryTable::new("state");
        let long_ago = Utc::now() - chrono::Duration::days(8);
        table.insert_raw(ProcessedRecord::new("ancient", long_ago)).unwrap();

        let rows = table.scan_since(long_ago - chrono::Duration::days(1)).await.unwrap();
        assert!(rows.is_empty());
        assert!(table.is_empty());
    }

    #[test]
    fn test_record_ttl() {
        let now = Utc::now();
        let record = ProcessedRecord::new("k", now);
        assert_eq!(record.ttl, now.timestamp() + 7 * 24 * 3600);
    }
}
