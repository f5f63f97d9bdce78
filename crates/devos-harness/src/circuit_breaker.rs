use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Error returned by [`CircuitBreaker::call`].
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError {
    #[error("circuit is open — refusing call")]
    Open,
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    #[error("inner error: {0}")]
    Inner(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls go through and are tracked.
    Closed,
    /// Calls are rejected outright until `timeout` has elapsed.
    Open,
    /// A single probe call is allowed through to test recovery.
    HalfOpen,
}

/// Tuning knobs for [`CircuitBreaker`]. The defaults are sized for the
/// Jira API client: a handful of 5xx/timeout attempts in a row means
/// Atlassian is down, not that this particular request was unlucky.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures (while Closed) before the circuit opens.
    pub failure_threshold: u32,
    /// Consecutive successes (while HalfOpen) before the circuit closes.
    pub success_threshold: u32,
    /// How long an open circuit stays open before allowing a probe call.
    pub timeout: Duration,
    /// Per-call deadline enforced independently of the caller's own timeout.
    pub call_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
            call_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
}

/// Wraps a fallible async call with the classic closed/open/half-open state
/// machine: trip after `failure_threshold` consecutive failures, reject
/// everything while open, allow one probe through once `timeout` elapses,
/// and require `success_threshold` consecutive probe successes before
/// trusting the upstream again.
///
/// Cloning shares the underlying state — every clone observes the same
/// circuit.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Arc<Mutex<BreakerState>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
            })),
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.state.lock().await.state
    }

    pub async fn failure_count(&self) -> u32 {
        self.state.lock().await.failure_count
    }

    pub async fn success_count(&self) -> u32 {
        self.state.lock().await.success_count
    }

    /// Runs `f` through the breaker. Rejects immediately with
    /// [`CircuitBreakerError::Open`] while tripped; otherwise enforces
    /// `call_timeout` around `f()` and folds the outcome into the state
    /// machine before returning it to the caller.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        {
            let mut guard = self.state.lock().await;
            match guard.state {
                CircuitState::Open => match guard.opened_at {
                    Some(opened_at) if opened_at.elapsed() >= self.config.timeout => {
                        info!("circuit breaker transitioning open -> half-open");
                        guard.state = CircuitState::HalfOpen;
                        guard.success_count = 0;
                    }
                    _ => return Err(CircuitBreakerError::Open),
                },
                CircuitState::Closed | CircuitState::HalfOpen => {}
            }
        }

        match tokio::time::timeout(self.config.call_timeout, f()).await {
            Ok(Ok(value)) => {
                self.record_success().await;
                Ok(value)
            }
            Ok(Err(e)) => {
                self.record_failure().await;
                Err(CircuitBreakerError::Inner(e.to_string()))
            }
            Err(_elapsed) => {
                self.record_failure().await;
                Err(CircuitBreakerError::Timeout(self.config.call_timeout))
            }
        }
    }

    async fn record_success(&self) {
        let mut guard = self.state.lock().await;
        match guard.state {
            CircuitState::HalfOpen => {
                guard.success_count += 1;
                if guard.success_count >= self.config.success_threshold {
                    info!("circuit breaker transitioning half-open -> closed");
                    guard.state = CircuitState::Closed;
                    guard.failure_count = 0;
                    guard.success_count = 0;
                }
            }
            CircuitState::Closed => guard.failure_count = 0,
            CircuitState::Open => {}
        }
    }

    async fn record_failure(&self) {
        let mut guard = self.state.lock().await;
        guard.failure_count += 1;
        guard.opened_at = Some(Instant::now());

        match guard.state {
            CircuitState::Closed => {
                if guard.failure_count >= self.config.failure_threshold {
                    warn!(failures = guard.failure_count, "circuit breaker transitioning closed -> open");
                    guard.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                warn!("probe call failed, circuit breaker transitioning half-open -> open");
                guard.state = CircuitState::Open;
                guard.success_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Forces the breaker back to `Closed`, zeroing both counters.
    pub async fn reset(&self) {
        let mut guard = self.state.lock().await;
        guard.state = CircuitState::Closed;
        guard.failure_count = 0;
        guard.success_count = 0;
        guard.opened_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig { failure_threshold: 2, ..Default::default() });
        for _ in 0..2 {
            let _ = cb.call(|| async { Err::<(), _>("upstream down") }).await;
        }
        assert_eq!(cb.state().await, CircuitState::Open);
        let result = cb.call(|| async { Ok::<_, &str>(()) }).await;
        assert!(matches!(result, Err(CircuitBreakerError::Open)));
    }

    #[tokio::test]
    async fn half_open_closes_after_success_threshold() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 2,
            timeout: Duration::from_millis(20),
            ..Default::default()
        });
        let _ = cb.call(|| async { Err::<(), _>("upstream down") }).await;
        assert_eq!(cb.state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(40)).await;
        cb.call(|| async { Ok::<_, &str>(()) }).await.unwrap();
        assert_eq!(cb.state().await, CircuitState::HalfOpen);
        cb.call(|| async { Ok::<_, &str>(()) }).await.unwrap();
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn call_timeout_counts_as_failure() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            call_timeout: Duration::from_millis(10),
            ..Default::default()
        });
        let result = cb
            .call(|| async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<(), &str>(())
            })
            .await;
        assert!(matches!(result, Err(CircuitBreakerError::Timeout(_))));
        assert_eq!(cb.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn reset_clears_an_open_circuit() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig { failure_threshold: 1, ..Default::default() });
        let _ = cb.call(|| async { Err::<(), _>("upstream down") }).await;
        assert_eq!(cb.state().await, CircuitState::Open);

        cb.reset().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
        assert_eq!(cb.failure_count().await, 0);
    }
}
