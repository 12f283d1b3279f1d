//! Object storage access for log buckets
//! Uses Apache Arrow object_store crate

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::{ObjectMeta, ObjectStore, path::Path as StoragePath};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Listing failed: {0}")]
    ListFailed(String),

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid store configuration: {0}")]
    InvalidConfig(String),

    #[error("Object store error: {0}")]
    ObjectStoreError(#[from] object_store::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Errors that will not go away by waiting for the next poll:
    /// bad credentials, missing permissions, missing bucket
    pub fn is_unrecoverable(&self) -> bool {
        match self {
            StorageError::AccessDenied(_) | StorageError::InvalidConfig(_) => true,
            StorageError::ObjectStoreError(e) => matches!(
                e,
                object_store::Error::PermissionDenied { .. }
                    | object_store::Error::Unauthenticated { .. }
            ),
            _ => false,
        }
    }
}

/// Storage result type
pub type Result<T> = std::result::Result<T, StorageError>;

/// What a listing returns for each object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// One page of a listing
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectSummary>,
    /// Continuation token; `None` on the last page
    pub next: Option<String>,
}

/// Paged listing and download, the only storage calls the pipeline makes
#[async_trait]
pub trait LogStore: Send + Sync {
    /// List keys under `prefix` (plain string prefix, not a directory)
    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        continuation: Option<&str>,
        page_size: usize,
    ) -> Result<ListPage>;

    /// Stream an object into `dest`, returning bytes written
    async fn download_to(&self, bucket: &str, key: &str, dest: &Path) -> Result<u64>;
}

/// Where buckets live
#[derive(Debug, Clone)]
pub enum StoreBackend {
    S3 {
        region: Option<String>,
        endpoint: Option<String>,
    },
    /// `{root}/{bucket}/...` on the local filesystem
    Local { root: PathBuf },
    Memory,
}

impl StoreBackend {
    /// S3 and the in-memory store list in ascending key order; a local
    /// directory walk does not
    fn lists_in_key_order(&self) -> bool {
        !matches!(self, StoreBackend::Local { .. })
    }
}

/// [`LogStore`] over object_store, one store handle per bucket
#[derive(Clone)]
pub struct StorageClient {
    backend: StoreBackend,
    stores: Arc<Mutex<HashMap<String, Arc<dyn ObjectStore>>>>,
}

impl StorageClient {
    pub fn new(backend: StoreBackend) -> Self {
        Self {
            backend,
            stores: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Create in-memory storage for testing/development
    pub fn in_memory() -> Self {
        Self::new(StoreBackend::Memory)
    }

    /// Store handle for `bucket`, built on first use
    pub fn store(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>> {
        let mut stores = self
            .stores
            .lock()
            .map_err(|_| StorageError::InvalidConfig("store cache poisoned".to_string()))?;

        if let Some(store) = stores.get(bucket) {
            return Ok(store.clone());
        }

        let store: Arc<dyn ObjectStore> = match &self.backend {
            StoreBackend::S3 { region, endpoint } => {
                let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
                if let Some(region) = region {
                    builder = builder.with_region(region);
                }
                if let Some(endpoint) = endpoint {
                    builder = builder
                        .with_endpoint(endpoint)
                        .with_allow_http(endpoint.starts_with("http://"));
                }
                Arc::new(builder.build().map_err(|e| StorageError::InvalidConfig(e.to_string()))?)
            }
            StoreBackend::Local { root } => {
                let dir = root.join(bucket);
                std::fs::create_dir_all(&dir)?;
                Arc::new(
                    LocalFileSystem::new_with_prefix(&dir)
                        .map_err(|e| StorageError::InvalidConfig(e.to_string()))?,
                )
            }
            StoreBackend::Memory => Arc::new(InMemory::new()),
        };

        stores.insert(bucket.to_string(), store.clone());
        tracing::debug!(bucket, backend = ?self.backend, "Opened bucket store");
        Ok(store)
    }

    /// Upload bytes to storage
    pub async fn upload(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<()> {
        let path = StoragePath::from(key);
        let size = data.len();
        self.store(bucket)?.put(&path, data.into()).await?;
        tracing::debug!(bucket, key, size, "Uploaded to storage");
        Ok(())
    }
}

/// Cut the page of up to `page_size` keys under `prefix` from a listing.
///
/// Continuation tokens are "start after this key", so pages are cut in key
/// order. An ordered listing is read only until the page is full or the keys
/// move past `prefix`; an unordered one is read to the end and sorted.
async fn collect_page(
    mut stream: BoxStream<'_, object_store::Result<ObjectMeta>>,
    bucket: &str,
    prefix: &str,
    page_size: usize,
    ordered: bool,
) -> Result<ListPage> {
    let page_size = page_size.max(1);
    let mut matched = Vec::new();

    while let Some(meta) = stream.next().await {
        let meta = meta.map_err(|e| classify(e, bucket))?;
        let key = meta.location.to_string();
        if !key.starts_with(prefix) {
            if ordered && key.as_str() > prefix {
                break;
            }
            continue;
        }
        matched.push(ObjectSummary {
            key,
            size: meta.size as u64,
            last_modified: meta.last_modified,
        });
        // One extra match tells us another page follows
        if ordered && matched.len() > page_size {
            break;
        }
    }

    if !ordered {
        matched.sort_by(|a, b| a.key.cmp(&b.key));
    }

    let mut page = ListPage::default();
    if matched.len() > page_size {
        matched.truncate(page_size);
        page.next = matched.last().map(|o| o.key.clone());
    }
    page.objects = matched;
    Ok(page)
}

/// Directory part of a key prefix: everything up to the last `/`
fn listing_dir(prefix: &str) -> Option<StoragePath> {
    prefix
        .rfind('/')
        .map(|idx| StoragePath::from(&prefix[..idx]))
}

fn classify(err: object_store::Error, bucket: &str) -> StorageError {
    match err {
        object_store::Error::PermissionDenied { .. } | object_store::Error::Unauthenticated { .. } => {
            StorageError::AccessDenied(format!("{}: {}", bucket, err))
        }
        object_store::Error::NotFound { .. } => StorageError::NotFound(format!("{}: {}", bucket, err)),
        other => StorageError::ListFailed(other.to_string()),
    }
}

#[async_trait]
impl LogStore for StorageClient {
    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        continuation: Option<&str>,
        page_size: usize,
    ) -> Result<ListPage> {
        let store = self.store(bucket)?;
        let dir = listing_dir(prefix);

        // object_store lists whole path segments, so list the enclosing
        // directory and match the key prefix here
        let stream = match continuation {
            Some(offset) => store.list_with_offset(dir.as_ref(), &StoragePath::from(offset)),
            None => store.list(dir.as_ref()),
        };
        let page = collect_page(stream, bucket, prefix, page_size, self.backend.lists_in_key_order()).await?;

        tracing::debug!(
            bucket,
            prefix,
            objects = page.objects.len(),
            last_page = page.next.is_none(),
            "Listed page"
        );
        Ok(page)
    }

    async fn download_to(&self, bucket: &str, key: &str, dest: &Path) -> Result<u64> {
        let store = self.store(bucket)?;
        let path = StoragePath::from(key);

        let result = store.get(&path).await.map_err(|e| match e {
            object_store::Error::NotFound { .. } => StorageError::NotFound(key.to_string()),
            other => StorageError::DownloadFailed(format!("{}: {}", key, other)),
        })?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = result.into_stream();
        let mut written = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| StorageError::DownloadFailed(format!("{}: {}", key, e)))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }

        file.flush().await?;
        file.sync_all().await?;

        tracing::debug!(bucket, key, bytes = written, "Downloaded from storage");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn create_test_client(keys: &[&str]) -> StorageClient {
        let client = StorageClient::in_memory();
        for key in keys {
            client
                .upload("logs", key, format!("body of {}", key).into_bytes())
                .await
                .unwrap();
        }
        client
    }

    #[tokio::test]
    async fn test_list_matches_partial_segment_prefix() {
        let client = create_test_client(&[
            "AWSLogs/1/elb/2018/08/20/1_elb_us-east-1_app.lb1_a.log.gz",
            "AWSLogs/1/elb/2018/08/20/1_elb_us-east-1_app.lb1_b.log.gz",
            "AWSLogs/1/elb/2018/08/20/1_elb_us-east-1_app.lb2_c.log.gz",
        ])
        .await;

        let page = client
            .list_page("logs", "AWSLogs/1/elb/2018/08/20/1_elb_us-east-1_app.lb1", None, 100)
            .await
            .unwrap();

        assert_eq!(page.objects.len(), 2);
        assert!(page.next.is_none());
        assert!(page.objects.iter().all(|o| o.key.contains("app.lb1_")));
    }

    #[tokio::test]
    async fn test_list_follows_pages() {
        let keys: Vec<String> = (0..5).map(|i| format!("d/p_{}", i)).collect();
        let refs: Vec<&str> = keys.iter().map(|k| k.as_str()).collect();
        let client = create_test_client(&refs).await;

        let mut seen = Vec::new();
        let mut continuation: Option<String> = None;
        let mut pages = 0;
        loop {
            let page = client
                .list_page("logs", "d/p_", continuation.as_deref(), 2)
                .await
                .unwrap();
            pages += 1;
            seen.extend(page.objects.into_iter().map(|o| o.key));
            match page.next {
                Some(next) => continuation = Some(next),
                None => break,
            }
        }

        assert_eq!(pages, 3);
        seen.sort();
        assert_eq!(seen, keys);
    }

    fn create_test_listing(keys: &[&str]) -> Vec<object_store::Result<ObjectMeta>> {
        keys.iter()
            .map(|key| {
                Ok(ObjectMeta {
                    location: StoragePath::from(*key),
                    last_modified: Utc::now(),
                    size: 1,
                    e_tag: None,
                    version: None,
                })
            })
            .collect()
    }

    fn broken_listing() -> object_store::Result<ObjectMeta> {
        Err(object_store::Error::Generic {
            store: "test",
            source: "listing read past the page".into(),
        })
    }

    #[tokio::test]
    async fn test_ordered_listing_stops_after_full_page() {
        let mut listing = create_test_listing(&["d/p_0", "d/p_1", "d/p_2", "d/p_3"]);
        listing.push(broken_listing());

        let page = collect_page(futures::stream::iter(listing).boxed(), "logs", "d/p_", 2, true)
            .await
            .unwrap();

        let keys: Vec<&str> = page.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["d/p_0", "d/p_1"]);
        assert_eq!(page.next.as_deref(), Some("d/p_1"));
    }

    #[tokio::test]
    async fn test_ordered_listing_stops_past_prefix() {
        let mut listing = create_test_listing(&["d/o_0", "d/p_0", "d/q_0"]);
        listing.push(broken_listing());

        let page = collect_page(futures::stream::iter(listing).boxed(), "logs", "d/p_", 10, true)
            .await
            .unwrap();

        assert_eq!(page.objects.len(), 1);
        assert_eq!(page.objects[0].key, "d/p_0");
        assert!(page.next.is_none());
    }

    #[tokio::test]
    async fn test_unordered_listing_is_sorted_before_cutting() {
        let listing = create_test_listing(&["d/p_2", "d/x", "d/p_0", "d/p_1"]);

        let page = collect_page(futures::stream::iter(listing).boxed(), "logs", "d/p_", 2, false)
            .await
            .unwrap();

        let keys: Vec<&str> = page.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["d/p_0", "d/p_1"]);
        assert_eq!(page.next.as_deref(), Some("d/p_1"));
    }

    #[tokio::test]
    async fn test_local_listing_follows_pages() {
        let root = TempDir::new().unwrap();
        let client = StorageClient::new(StoreBackend::Local {
            root: root.path().to_path_buf(),
        });
        let mut keys: Vec<String> = (0..5).map(|i| format!("d/p_{}", i)).collect();
        for key in keys.iter().rev() {
            client.upload("logs", key, b"x".to_vec()).await.unwrap();
        }
        client.upload("logs", "d/other", b"x".to_vec()).await.unwrap();

        let mut seen = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let page = client
                .list_page("logs", "d/p_", continuation.as_deref(), 2)
                .await
                .unwrap();
            seen.extend(page.objects.into_iter().map(|o| o.key));
            match page.next {
                Some(next) => continuation = Some(next),
                None => break,
            }
        }

        keys.sort();
        assert_eq!(seen, keys);
    }

    #[tokio::test]
    async fn test_download_to_file() {
        let client = create_test_client(&["d/obj"]).await;
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("out");

        let written = client.download_to("logs", "d/obj", &dest).await.unwrap();

        assert_eq!(written, "body of d/obj".len() as u64);
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "body of d/obj");
    }

    #[tokio::test]
    async fn test_download_missing_object() {
        let client = create_test_client(&[]).await;
        let temp = TempDir::new().unwrap();

        let result = client.download_to("logs", "nope", &temp.path().join("x")).await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_buckets_are_isolated() {
        let client = create_test_client(&["d/a"]).await;
        let page = client.list_page("other", "d/", None, 10).await.unwrap();
        assert!(page.objects.is_empty());
    }

    #[test]
    fn test_unrecoverable_classification() {
        assert!(StorageError::AccessDenied("x".into()).is_unrecoverable());
        assert!(!StorageError::ListFailed("timeout".into()).is_unrecoverable());
        assert!(!StorageError::NotFound("k".into()).is_unrecoverable());
    }
}
