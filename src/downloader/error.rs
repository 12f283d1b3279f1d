use thiserror::Error;

use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum DownloadError {
    /// Listing failed in a way another poll cycle will not fix
    #[error("Listing {bucket}/{prefix} failed permanently: {source}")]
    Unrecoverable {
        bucket: String,
        prefix: String,
        #[source]
        source: StorageError,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Output channel closed")]
    OutputClosed,
}

pub type Result<T> = std::result::Result<T, DownloadError>;
