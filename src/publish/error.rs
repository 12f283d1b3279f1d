use thiserror::Error;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed log document: {0}")]
    Malformed(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Connection timeout")]
    Timeout,

    #[error("Events rejected with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Invalid sink configuration: {0}")]
    InvalidConfig(String),

    #[error("Parser task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, PublishError>;
