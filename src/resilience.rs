//! Retry, circuit breaking and panic isolation shared by every component.

use crate::errors::ErrorHandler;
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Upper bound on any backoff delay.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Retry an async operation with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    attempts: u32,
    base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay: Duration) -> Self {
        Self { attempts, base_delay }
    }

    /// Delay before the given retry (1-based), doubling and capped at 30 s.
    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << (attempt - 1).min(16);
        self.base_delay.saturating_mul(factor).min(MAX_BACKOFF)
    }

    /// Run `op` until it succeeds or the attempt budget is exhausted,
    /// returning the first success or the last error.
    pub async fn run<T, F, Fut>(&self, description: &str, mut op: F) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut last_err = None;
        for attempt in 0..=self.attempts {
            if attempt > 0 {
                let delay = self.delay_for(attempt);
                debug!(
                    description,
                    attempt,
                    max_attempts = self.attempts,
                    delay_ms = delay.as_millis() as u64,
                    "retrying"
                );
                tokio::time::sleep(delay).await;
            }

            match op().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(description, retries = attempt, "succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    warn!(description, attempt = attempt + 1, error = %e, "attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.expect("at least one attempt runs"))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(5))
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Failing fast
    Open,
    /// Probing whether the dependency recovered
    HalfOpen,
}

struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
}

/// Fails fast after `failure_threshold` consecutive failures; after `timeout`
/// the next call probes the dependency (half-open) and a success closes the
/// circuit again.
pub struct CircuitBreaker {
    failure_threshold: u32,
    timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, timeout: Duration) -> Self {
        Self {
            failure_threshold,
            timeout,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
    }

    /// Returns an error without running `op` while the circuit is open.
    pub async fn execute<T, F, Fut>(&self, op: F) -> anyhow::Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        {
            let mut inner = self.inner.lock();
            if inner.state == CircuitState::Open {
                let elapsed = inner.last_failure.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed > self.timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.failure_count = 0;
                } else {
                    anyhow::bail!("circuit breaker is open");
                }
            }
        }

        match op().await {
            Ok(value) => {
                let mut inner = self.inner.lock();
                if inner.state == CircuitState::HalfOpen {
                    inner.state = CircuitState::Closed;
                }
                inner.failure_count = 0;
                Ok(value)
            }
            Err(e) => {
                let mut inner = self.inner.lock();
                inner.failure_count += 1;
                inner.last_failure = Some(Instant::now());
                if inner.state == CircuitState::HalfOpen
                    || inner.failure_count >= self.failure_threshold
                {
                    inner.state = CircuitState::Open;
                }
                Err(e)
            }
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(30))
    }
}

/// Spawn a background task whose panics are contained and reported as
/// Critical instead of taking the process down.
pub fn spawn_guarded<F>(name: &'static str, handler: Arc<ErrorHandler>, future: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(panic) = std::panic::AssertUnwindSafe(future).catch_unwind().await {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());
            handler.critical(name, "background task panicked", anyhow::anyhow!(detail));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retry_first_try_success() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let calls = AtomicU32::new(0);

        let result = policy
            .run("op", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, anyhow::Error>(42) }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_recovers_after_failures() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let calls = AtomicU32::new(0);

        let result = policy
            .run("op", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        anyhow::bail!("not yet")
                    }
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_and_returns_last_error() {
        let policy = RetryPolicy::new(2, Duration::from_millis(1));
        let calls = AtomicU32::new(0);

        let result: anyhow::Result<()> = policy
            .run("op", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { anyhow::bail!("failure {}", n) }
            })
            .await;

        // 1 initial + 2 retries
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.unwrap_err().to_string(), "failure 2");
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(10, Duration::from_secs(5));
        assert_eq!(policy.delay_for(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for(2), Duration::from_secs(10));
        assert_eq!(policy.delay_for(3), Duration::from_secs(20));
        assert_eq!(policy.delay_for(4), Duration::from_secs(30));
        assert_eq!(policy.delay_for(9), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_breaker_opens_after_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));

        for _ in 0..3 {
            let _ = breaker
                .execute(|| async { Err::<(), _>(anyhow::anyhow!("down")) })
                .await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        // Next call fails fast without running the operation
        let ran = AtomicU32::new(0);
        let result = breaker
            .execute(|| {
                ran.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, anyhow::Error>(()) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_breaker_half_open_recovery() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(10));

        let _ = breaker
            .execute(|| async { Err::<(), _>(anyhow::anyhow!("down")) })
            .await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(20)).await;

        let result = breaker.execute(|| async { Ok::<_, anyhow::Error>(1) }).await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_breaker_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(10));

        let _ = breaker
            .execute(|| async { Err::<(), _>(anyhow::anyhow!("down")) })
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let _ = breaker
            .execute(|| async { Err::<(), _>(anyhow::anyhow!("still down")) })
            .await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_spawn_guarded_contains_panic() {
        let handler = Arc::new(ErrorHandler::new(false));
        let handle = spawn_guarded("test-task", Arc::clone(&handler), async {
            panic!("deliberate");
        });

        // The join handle itself resolves cleanly; the panic became an error
        handle.await.unwrap();
        assert_eq!(handler.error_count(), 1);
    }
}
