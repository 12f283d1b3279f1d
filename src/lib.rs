pub mod config;
pub mod downloader;
pub mod ingest;
pub mod limiter;
pub mod observability;
pub mod publish;
pub mod source;
pub mod state;
pub mod storage;
