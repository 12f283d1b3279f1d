//! Download concurrency limiting
//!
//! One limiter is shared by every downloader in the process so that many
//! entities across regions and accounts do not rate-limit themselves against
//! the same storage endpoint. Acquisition has no timeout: a full limiter is
//! backpressure, not failure.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Error)]
#[error("concurrency limiter closed")]
pub struct LimiterClosed;

/// Counting semaphore over in-flight downloads, or no limit at all
#[derive(Clone, Debug)]
pub struct ConcurrencyLimiter {
    inner: Option<Arc<Bounded>>,
}

#[derive(Debug)]
struct Bounded {
    semaphore: Arc<Semaphore>,
    limit: usize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl Default for ConcurrencyLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl ConcurrencyLimiter {
    /// No-op limiter
    pub fn unlimited() -> Self {
        Self { inner: None }
    }

    /// Allow at most `limit` concurrent holders
    pub fn bounded(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            inner: Some(Arc::new(Bounded {
                semaphore: Arc::new(Semaphore::new(limit)),
                limit,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            })),
        }
    }

    /// `Some(n)` builds a bounded limiter, `None` an unlimited one
    pub fn from_limit(limit: Option<usize>) -> Self {
        match limit {
            Some(n) => Self::bounded(n),
            None => Self::unlimited(),
        }
    }

    pub fn limit(&self) -> Option<usize> {
        self.inner.as_ref().map(|b| b.limit)
    }

    /// Wait for a free slot. The slot is released when the permit is
    /// released or dropped.
    pub async fn acquire(&self) -> Result<LimiterPermit, LimiterClosed> {
        let Some(bounded) = &self.inner else {
            return Ok(LimiterPermit { held: None });
        };

        let permit = bounded
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| LimiterClosed)?;

        let now = bounded.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        bounded.peak.fetch_max(now, Ordering::SeqCst);

        Ok(LimiterPermit {
            held: Some((permit, bounded.clone())),
        })
    }

    /// Holders right now (always 0 when unlimited)
    pub fn in_flight(&self) -> usize {
        self.inner
            .as_ref()
            .map(|b| b.in_flight.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Highest number of simultaneous holders observed
    pub fn peak(&self) -> usize {
        self.inner
            .as_ref()
            .map(|b| b.peak.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

/// A held limiter slot
#[derive(Debug)]
pub struct LimiterPermit {
    held: Option<(OwnedSemaphorePermit, Arc<Bounded>)>,
}

impl LimiterPermit {
    /// Free the slot
    pub fn release(self) {}
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        if let Some((permit, bounded)) = self.held.take() {
            bounded.in_flight.fetch_sub(1, Ordering::SeqCst);
            drop(permit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_unlimited_never_blocks() {
        let limiter = ConcurrencyLimiter::unlimited();
        let permits: Vec<_> = futures::future::join_all((0..100).map(|_| limiter.acquire()))
            .await
            .into_iter()
            .map(|p| p.unwrap())
            .collect();
        assert_eq!(permits.len(), 100);
        assert_eq!(limiter.limit(), None);
        assert_eq!(limiter.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_bounded_limits_concurrent_holders() {
        let limiter = ConcurrencyLimiter::bounded(3);
        let current = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let limiter = limiter.clone();
            let current = current.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let permit = limiter.acquire().await.unwrap();
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                permit.release();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(max_seen.load(Ordering::SeqCst) <= 3);
        assert!(limiter.peak() <= 3);
        assert_eq!(limiter.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_acquire_blocks_until_release() {
        let limiter = ConcurrencyLimiter::bounded(1);
        let first = limiter.acquire().await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), limiter.acquire()).await;
        assert!(blocked.is_err());

        first.release();
        let second = tokio::time::timeout(Duration::from_millis(50), limiter.acquire()).await;
        assert!(second.is_ok());
    }

    #[test]
    fn test_zero_limit_is_clamped() {
        let limiter = ConcurrencyLimiter::bounded(0);
        assert_eq!(limiter.limit(), Some(1));
    }
}
