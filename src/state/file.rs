use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::error::{Result, StateError};
use super::{ProcessedObjects, Stater, within_window};

/// Local-filesystem state, one JSON document per service
///
/// Correct under the assumption that this process is the only writer of the
/// file. Concurrent downloaders inside the process share one instance and are
/// serialized by its mutex.
pub struct FileStater {
    lock: Mutex<()>,
    path: PathBuf,
    backfill: chrono::Duration,
}

impl FileStater {
    pub fn new<P: AsRef<Path>>(state_dir: P, service: &str, backfill: chrono::Duration) -> Self {
        let path = state_file_path(state_dir.as_ref(), service);
        info!(path = %path.display(), "Using file state store");
        Self {
            lock: Mutex::new(()),
            path,
            backfill,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the state document, creating an empty one on first use
    async fn load(&self) -> Result<ProcessedObjects> {
        match tokio::fs::try_exists(&self.path).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(path = %self.path.display(), "State file missing, initializing");
                tokio::fs::write(&self.path, b"{}").await.map_err(|e| {
                    StateError::StorageUnavailable(format!(
                        "cannot create {}: {}",
                        self.path.display(),
                        e
                    ))
                })?;
                return Ok(ProcessedObjects::new());
            }
            Err(e) => {
                return Err(StateError::StorageUnavailable(format!(
                    "cannot stat {}: {}",
                    self.path.display(),
                    e
                )));
            }
        }

        let data = tokio::fs::read(&self.path).await.map_err(|e| {
            StateError::StorageUnavailable(format!("cannot read {}: {}", self.path.display(), e))
        })?;

        Ok(serde_json::from_slice(&data)?)
    }

    /// Replace the state document via write-then-rename
    async fn store(&self, objects: &ProcessedObjects) -> Result<()> {
        let data = serde_json::to_vec(objects)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    pub(crate) async fn mark_processed_at(&self, object: &str, now: DateTime<Utc>) -> Result<()> {
        let _guard = self.lock.lock().await;

        let mut objects = self.load().await?;

        // Reap records outside the backfill interval so the file stays bounded
        let before = objects.len();
        objects.retain(|_, marked_at| within_window(*marked_at, now, self.backfill));
        let pruned = before - objects.len();
        if pruned > 0 {
            debug!(pruned, path = %self.path.display(), "Pruned expired state records");
        }

        objects.insert(object.to_string(), now);
        self.store(&objects).await
    }
}

#[async_trait]
impl Stater for FileStater {
    async fn list_processed(&self) -> Result<ProcessedObjects> {
        let _guard = self.lock.lock().await;
        let now = Utc::now();
        let mut objects = self.load().await?;
        objects.retain(|_, marked_at| within_window(*marked_at, now, self.backfill));
        Ok(objects)
    }

    async fn mark_processed(&self, object: &str) -> Result<()> {
        self.mark_processed_at(object, Utc::now()).await
    }
}

/// `{state_dir}/{service}-state.json`
pub fn state_file_path(state_dir: &Path, service: &str) -> PathBuf {
    state_dir.join(format!("{}-state.json", service))
}

/// Per-entity state files written by older deployments
/// (`{service}-state-{entity}.json`, a JSON array of mangled keys).
///
/// They carry no timestamps and their keys cannot be mapped back to object
/// keys, so they are reported rather than imported.
pub fn legacy_state_files(state_dir: &Path, service: &str) -> std::io::Result<Vec<PathBuf>> {
    let prefix = format!("{}-state-", service);
    let mut found = Vec::new();

    for entry in std::fs::read_dir(state_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(&prefix) && name.ends_with(".json") {
            found.push(entry.path());
        }
    }

    found.sort();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn create_test_stater(backfill_hours: i64) -> (FileStater, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let stater = FileStater::new(
            temp_dir.path(),
            "elasticloadbalancingv2",
            chrono::Duration::hours(backfill_hours),
        );
        (stater, temp_dir)
    }

    #[tokio::test]
    async fn test_first_use_creates_empty_file() {
        let (stater, temp) = create_test_stater(1);

        let processed = stater.list_processed().await.unwrap();
        assert!(processed.is_empty());

        let path = temp.path().join("elasticloadbalancingv2-state.json");
        assert_eq!(std::fs::read_to_string(path).unwrap(), "{}");
    }

    #[tokio::test]
    async fn test_mark_then_list() {
        let (stater, _temp) = create_test_stater(1);

        stater.mark_processed("AWSLogs/1/a.log.gz").await.unwrap();
        stater.mark_processed("AWSLogs/1/b.log.gz").await.unwrap();

        let processed = stater.list_processed().await.unwrap();
        assert_eq!(processed.len(), 2);
        assert!(processed.contains_key("AWSLogs/1/a.log.gz"));
        assert!(processed.contains_key("AWSLogs/1/b.log.gz"));
    }

    #[tokio::test]
    async fn test_mark_is_idempotent() {
        let (stater, _temp) = create_test_stater(1);

        stater.mark_processed("obj").await.unwrap();
        stater.mark_processed("obj").await.unwrap();

        assert_eq!(stater.list_processed().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_mark_prunes_expired_records() {
        let (stater, _temp) = create_test_stater(1);
        let now = Utc::now();

        let mut seeded: HashMap<String, DateTime<Utc>> = HashMap::new();
        seeded.insert("old".to_string(), now - chrono::Duration::hours(3));
        seeded.insert("recent".to_string(), now - chrono::Duration::minutes(10));
        std::fs::write(stater.path(), serde_json::to_vec(&seeded).unwrap()).unwrap();

        stater.mark_processed_at("new", now).await.unwrap();

        let on_disk: HashMap<String, DateTime<Utc>> =
            serde_json::from_slice(&std::fs::read(stater.path()).unwrap()).unwrap();
        assert_eq!(on_disk.len(), 2);
        assert!(!on_disk.contains_key("old"));
        assert!(on_disk.contains_key("recent"));
        assert!(on_disk.contains_key("new"));
    }

    #[tokio::test]
    async fn test_list_never_returns_expired_records() {
        let (stater, _temp) = create_test_stater(2);
        let now = Utc::now();

        let mut seeded: HashMap<String, DateTime<Utc>> = HashMap::new();
        seeded.insert("expired".to_string(), now - chrono::Duration::hours(5));
        seeded.insert("live".to_string(), now - chrono::Duration::hours(1));
        std::fs::write(stater.path(), serde_json::to_vec(&seeded).unwrap()).unwrap();

        let processed = stater.list_processed().await.unwrap();
        assert_eq!(processed.len(), 1);
        assert!(processed.contains_key("live"));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let (stater, _temp) = create_test_stater(1);
        std::fs::write(stater.path(), b"not json").unwrap();

        let result = stater.list_processed().await;
        assert!(matches!(result, Err(StateError::Serialization(_))));
    }

    #[tokio::test]
    async fn test_missing_directory_is_unavailable() {
        let temp = TempDir::new().unwrap();
        let stater = FileStater::new(
            temp.path().join("does-not-exist"),
            "cloudfront",
            chrono::Duration::hours(1),
        );

        let result = stater.list_processed().await;
        assert!(matches!(result, Err(StateError::StorageUnavailable(_))));
    }

    #[tokio::test]
    async fn test_concurrent_marks_are_serialized() {
        let (stater, _temp) = create_test_stater(1);
        let stater = std::sync::Arc::new(stater);

        let mut handles = Vec::new();
        for i in 0..20 {
            let stater = stater.clone();
            handles.push(tokio::spawn(async move {
                stater.mark_processed(&format!("obj-{}", i)).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(stater.list_processed().await.unwrap().len(), 20);
    }

    #[test]
    fn test_legacy_state_files() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("elasticloadbalancing-state-lb1.json"), b"[]").unwrap();
        std::fs::write(temp.path().join("elasticloadbalancing-state.json"), b"{}").unwrap();
        std::fs::write(temp.path().join("cloudfront-state-d1.json"), b"[]").unwrap();

        let found = legacy_state_files(temp.path(), "elasticloadbalancing").unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].ends_with("elasticloadbalancing-state-lb1.json"));
    }
}
