use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("State storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Table '{table}' error: {message}")]
    Table { table: String, message: String },

    #[error("Invalid record: {0}")]
    InvalidRecord(String),
}

pub type Result<T> = std::result::Result<T, StateError>;
