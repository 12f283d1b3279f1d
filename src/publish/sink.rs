//! Event delivery

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use super::Event;
use super::error::{PublishError, Result};

pub const WRITE_KEY_HEADER: &str = "X-Honeycomb-Team";

/// Upper bound on the wait between two attempts
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send(&self, events: &[Event]) -> Result<()>;
}

/// HTTP sink configuration
#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub api_host: String,
    pub dataset: String,
    pub write_key: String,
    pub batch_size: usize,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub max_retries: u32,
    /// First retry delay, doubled on every further attempt
    pub backoff: Duration,
    pub user_agent: String,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            api_host: "https://api.honeycomb.io/".to_string(),
            dataset: String::new(),
            write_key: String::new(),
            batch_size: 500,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            max_retries: 3,
            backoff: Duration::from_secs(1),
            user_agent: format!("logbucket/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl SinkConfig {
    /// Delay after failed attempt `attempt` (1-based): 1x, 2x, 4x, capped at [`MAX_BACKOFF`]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt.saturating_sub(1))
            .and_then(|factor| self.backoff.checked_mul(factor))
            .map_or(MAX_BACKOFF, |delay| delay.min(MAX_BACKOFF))
    }
}

/// Per-event result of a batch post
#[derive(Debug, Deserialize)]
struct BatchStatus {
    status: u16,
    #[serde(default)]
    error: Option<String>,
}

/// Posts events to `{api_host}/1/batch/{dataset}`
pub struct HttpSink {
    client: Client,
    config: SinkConfig,
    url: String,
}

impl HttpSink {
    pub fn new(config: SinkConfig) -> Result<Self> {
        if config.write_key.is_empty() {
            return Err(PublishError::InvalidConfig("write key is empty".to_string()));
        }
        if config.dataset.is_empty() {
            return Err(PublishError::InvalidConfig("dataset is empty".to_string()));
        }

        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| PublishError::RequestFailed(e.to_string()))?;

        let url = format!(
            "{}/1/batch/{}",
            config.api_host.trim_end_matches('/'),
            config.dataset
        );

        Ok(Self { client, config, url })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Post one batch with retry
    async fn post_batch(&self, batch: &[Event]) -> Result<()> {
        let body = serde_json::to_vec(batch)?;
        let mut attempts = 0;

        loop {
            attempts += 1;

            match self.post_once(&body).await {
                Ok(rejected) => {
                    if attempts > 1 {
                        debug!(url = %self.url, attempts, "Batch accepted after retry");
                    }
                    if rejected > 0 {
                        warn!(dataset = %self.config.dataset, rejected, sent = batch.len(), "Some events were rejected");
                    }
                    return Ok(());
                }
                Err(e) => {
                    let retryable = match &e {
                        PublishError::Rejected { status, .. } => *status >= 500 || *status == 429,
                        PublishError::Timeout | PublishError::RequestFailed(_) => true,
                        _ => false,
                    };

                    if !retryable || attempts >= self.config.max_retries {
                        warn!(url = %self.url, attempts, error = %e, "Batch send failed");
                        return Err(e);
                    }

                    warn!(url = %self.url, attempts, error = %e, "Batch send failed, retrying");

                    tokio::time::sleep(self.config.backoff_for(attempts)).await;
                }
            }
        }
    }

    /// Post once (no retry). Returns how many events the API refused.
    async fn post_once(&self, body: &[u8]) -> Result<usize> {
        let response = self
            .client
            .post(&self.url)
            .header(WRITE_KEY_HEADER, &self.config.write_key)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    PublishError::Timeout
                } else {
                    PublishError::RequestFailed(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PublishError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        // The body lists one status per event; an unreadable body still
        // means the batch was accepted
        let statuses: Vec<BatchStatus> = response.json().await.unwrap_or_default();
        let rejected: Vec<&BatchStatus> = statuses.iter().filter(|s| s.status >= 300).collect();
        if let Some(first) = rejected.first() {
            debug!(status = first.status, error = ?first.error, "First rejected event");
        }
        Ok(rejected.len())
    }
}

#[async_trait]
impl EventSink for HttpSink {
    async fn send(&self, events: &[Event]) -> Result<()> {
        for batch in events.chunks(self.config.batch_size.max(1)) {
            self.post_batch(batch).await?;
            debug!(dataset = %self.config.dataset, events = batch.len(), "Batch sent");
        }
        Ok(())
    }
}

/// Collects events in memory
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn send(&self, events: &[Event]) -> Result<()> {
        let mut stored = self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        stored.extend_from_slice(events);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> SinkConfig {
        SinkConfig {
            api_host: "https://api.example.com/".to_string(),
            dataset: "aws-alb-access".to_string(),
            write_key: "key".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_sink_config_defaults() {
        let config = SinkConfig::default();
        assert_eq!(config.api_host, "https://api.honeycomb.io/");
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.max_retries, 3);
        assert!(config.user_agent.starts_with("logbucket/"));
    }

    #[test]
    fn test_batch_url() {
        let sink = HttpSink::new(create_test_config()).unwrap();
        assert_eq!(sink.url(), "https://api.example.com/1/batch/aws-alb-access");
    }

    #[test]
    fn test_missing_write_key_rejected() {
        let config = SinkConfig {
            write_key: String::new(),
            ..create_test_config()
        };
        assert!(matches!(HttpSink::new(config), Err(PublishError::InvalidConfig(_))));
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let config = create_test_config();
        assert_eq!(config.backoff_for(1), Duration::from_secs(1));
        assert_eq!(config.backoff_for(2), Duration::from_secs(2));
        assert_eq!(config.backoff_for(3), Duration::from_secs(4));
        assert_eq!(config.backoff_for(7), MAX_BACKOFF);
    }

    #[test]
    fn test_backoff_with_many_retries_does_not_overflow() {
        let config = SinkConfig {
            max_retries: 100,
            ..create_test_config()
        };
        for attempt in [32, 33, 64, config.max_retries, u32::MAX] {
            assert_eq!(config.backoff_for(attempt), MAX_BACKOFF);
        }
    }

    #[tokio::test]
    async fn test_memory_sink_collects() {
        let sink = MemorySink::new();
        let event = Event::new(chrono::Utc::now(), serde_json::Map::new());
        sink.send(&[event.clone(), event]).await.unwrap();
        assert_eq!(sink.events().len(), 2);
    }
}
