//! Sliding-window rate limiter for the Jira API client.
//!
//! Unlike a token bucket, this counts timestamped requests that fall inside
//! the trailing window, which is what `jira-rate:{integrationId}` needs: 90
//! requests per rolling 60s window, per integration, surviving process
//! restarts because it lives in the shared [`CacheBackend`] rather than
//! process memory.

use devos_core::cache::CacheBackend;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("rate limit exceeded for key `{key}`, retry after {retry_after:?}")]
    Exceeded { key: String, retry_after: Duration },
}

#[derive(Debug, Clone)]
pub struct SlidingWindowConfig {
    pub window: Duration,
    pub threshold: usize,
    /// TTL applied to the sorted-set key after a successful check, so a
    /// quiet integration's bookkeeping doesn't live forever.
    pub key_ttl: Duration,
}

impl Default for SlidingWindowConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            threshold: 90,
            key_ttl: Duration::from_secs(120),
        }
    }
}

pub struct SlidingWindowRateLimiter {
    cache: Arc<dyn CacheBackend>,
    config: SlidingWindowConfig,
}

impl SlidingWindowRateLimiter {
    pub fn new(cache: Arc<dyn CacheBackend>, config: SlidingWindowConfig) -> Self {
        Self { cache, config }
    }

    /// Record a call attempt for `key` (e.g. `jira-rate:{integration_id}`) and
    /// check whether it is within the window's threshold. Expired entries are
    /// trimmed from the window before counting, and the key's TTL is renewed
    /// on success so a rate limiter key never outlives its own window by much.
    pub async fn check(&self, key: &str) -> Result<(), RateLimitError> {
        let now = now_millis();
        let window_start = now.saturating_sub(self.config.window.as_millis() as u64);

        self.cache
            .zremrangebyscore(key, 0.0, window_start as f64)
            .await;

        let count = self.cache.zcard(key).await;
        if count >= self.config.threshold {
            return Err(RateLimitError::Exceeded {
                key: key.to_string(),
                retry_after: self.config.window,
            });
        }

        let member = format!("{now}-{}", uuid::Uuid::new_v4());
        self.cache.zadd(key, now as f64, &member).await;
        self.cache.expire(key, self.config.key_ttl).await;
        Ok(())
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use devos_core::cache::InMemoryCacheBackend;

    #[tokio::test]
    async fn allows_requests_under_threshold() {
        let cache: Arc<dyn CacheBackend> = Arc::new(InMemoryCacheBackend::new());
        let limiter = SlidingWindowRateLimiter::new(
            cache,
            SlidingWindowConfig { threshold: 3, ..Default::default() },
        );
        for _ in 0..3 {
            assert!(limiter.check("jira-rate:INT1").await.is_ok());
        }
    }

    #[tokio::test]
    async fn rejects_once_threshold_reached() {
        let cache: Arc<dyn CacheBackend> = Arc::new(InMemoryCacheBackend::new());
        let limiter = SlidingWindowRateLimiter::new(
            cache,
            SlidingWindowConfig { threshold: 2, ..Default::default() },
        );
        assert!(limiter.check("jira-rate:INT1").await.is_ok());
        assert!(limiter.check("jira-rate:INT1").await.is_ok());
        let err = limiter.check("jira-rate:INT1").await;
        assert!(matches!(err, Err(RateLimitError::Exceeded { .. })));
    }

    #[tokio::test]
    async fn separate_keys_do_not_share_a_window() {
        let cache: Arc<dyn CacheBackend> = Arc::new(InMemoryCacheBackend::new());
        let limiter = SlidingWindowRateLimiter::new(
            cache,
            SlidingWindowConfig { threshold: 1, ..Default::default() },
        );
        assert!(limiter.check("jira-rate:INT1").await.is_ok());
        assert!(limiter.check("jira-rate:INT2").await.is_ok());
        assert!(limiter.check("jira-rate:INT1").await.is_err());
    }
}
