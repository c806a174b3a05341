//! Bounded retry with exponential backoff and a per-provider circuit breaker.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::ProviderError;

// ── Retry ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay randomised in either direction, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let raw = self
            .base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return raw;
        }
        let factor = 1.0 - jitter + 2.0 * jitter * fastrand::f64();
        raw.mul_f64(factor).min(self.max_delay)
    }

    /// Picks the provider's hint when it gave one, otherwise the backoff.
    pub fn delay_after(&self, error: &ProviderError, attempt: u32) -> Duration {
        error
            .retry_after()
            .map(|d| d.min(self.max_delay))
            .unwrap_or_else(|| self.delay_for(attempt))
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or
    /// `max_attempts` is reached.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.delay_after(&e, attempt);
                    tracing::warn!(
                        "{} attempt {}/{} failed: {}; retrying in {:?}",
                        label,
                        attempt,
                        max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ── Circuit breaker ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    failure_threshold: u32,
    open_for: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, failure_threshold: u32, open_for: Duration) -> Self {
        Self {
            name,
            failure_threshold: failure_threshold.max(1),
            open_for,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        // The guarded data stays consistent even if a holder panicked.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether a call may proceed now. Moves `Open` to `HalfOpen` once the
    /// cool-down has elapsed and admits a single trial call.
    fn try_acquire(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .map(|t| t.elapsed() >= self.open_for)
                    .unwrap_or(true);
                if cooled {
                    tracing::info!("circuit for {} half-open", self.name);
                    inner.state = CircuitState::HalfOpen;
                    inner.opened_at = Some(Instant::now());
                    inner.trial_in_flight = true;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                // A trial dropped before finishing must not wedge the breaker.
                let stale = inner
                    .opened_at
                    .map(|t| t.elapsed() >= self.open_for)
                    .unwrap_or(true);
                if inner.trial_in_flight && !stale {
                    false
                } else {
                    inner.opened_at = Some(Instant::now());
                    inner.trial_in_flight = true;
                    true
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            tracing::info!("circuit for {} closed", self.name);
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures += 1;
        inner.trial_in_flight = false;
        let trip = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.consecutive_failures >= self.failure_threshold,
            CircuitState::Open => false,
        };
        if trip {
            tracing::warn!(
                "circuit for {} opened after {} consecutive failures",
                self.name,
                inner.consecutive_failures
            );
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    /// Runs `op` through the breaker. Only retryable failures count against
    /// the provider; any other outcome means it answered.
    pub async fn call<T, Fut>(&self, op: Fut) -> Result<T, ProviderError>
    where
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        if !self.try_acquire() {
            return Err(ProviderError::CircuitOpen(self.name));
        }
        let result = op.await;
        match &result {
            Err(e) if e.is_retryable() => self.record_failure(),
            _ => self.record_success(),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::sync::Notify;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            jitter: 0.0,
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = no_jitter();
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(200), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = RetryPolicy {
            jitter: 0.5,
            ..no_jitter()
        };
        for _ in 0..200 {
            let d = policy.delay_for(2);
            assert!(d >= Duration::from_millis(99), "{:?}", d);
            assert!(d <= Duration::from_millis(300), "{:?}", d);
        }
    }

    #[test]
    fn test_retry_after_hint_wins_but_is_capped() {
        let policy = no_jitter();
        let hinted = ProviderError::RateLimited {
            retry_after: Some(Duration::from_millis(300)),
        };
        assert_eq!(policy.delay_after(&hinted, 1), Duration::from_millis(300));

        let huge = ProviderError::RateLimited {
            retry_after: Some(Duration::from_secs(600)),
        };
        assert_eq!(policy.delay_after(&huge, 1), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retries_transient_errors() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = no_jitter()
            .run("test", move || async move {
                let calls = counter;
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(ProviderError::Timeout)
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = no_jitter()
            .run("test", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::Network("reset".into()))
            })
            .await;
        assert!(matches!(result, Err(ProviderError::Network(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_run_does_not_retry_permanent_errors() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = no_jitter()
            .run("test", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::Auth("bad key".into()))
            })
            .await;
        assert!(matches!(result, Err(ProviderError::Auth(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_and_recovers() {
        let breaker = CircuitBreaker::new("gemini", 2, Duration::from_secs(10));

        for _ in 0..2 {
            let r: Result<(), _> = breaker.call(async { Err(ProviderError::Timeout) }).await;
            assert!(r.is_err());
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let rejected: Result<(), _> = breaker.call(async { Ok(()) }).await;
        assert!(matches!(rejected, Err(ProviderError::CircuitOpen("gemini"))));

        tokio::time::advance(Duration::from_secs(11)).await;
        breaker.call(async { Ok(()) }).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens() {
        let breaker = CircuitBreaker::new("openai", 1, Duration::from_secs(5));
        let _: Result<(), _> = breaker.call(async { Err(ProviderError::Timeout) }).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(6)).await;
        let _: Result<(), _> = breaker
            .call(async { Err(ProviderError::Network("down".into())) })
            .await;
        assert_eq!(breaker.state(), CircuitState::Open);

        let rejected: Result<(), _> = breaker.call(async { Ok(()) }).await;
        assert!(matches!(rejected, Err(ProviderError::CircuitOpen(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_a_single_trial() {
        let breaker = Arc::new(CircuitBreaker::new("gemini", 1, Duration::from_secs(5)));
        let _: Result<(), _> = breaker.call(async { Err(ProviderError::Timeout) }).await;
        tokio::time::advance(Duration::from_secs(6)).await;

        let gate = Arc::new(Notify::new());
        let trial = tokio::spawn({
            let breaker = breaker.clone();
            let gate = gate.clone();
            async move {
                breaker
                    .call(async move {
                        gate.notified().await;
                        Ok::<_, ProviderError>(())
                    })
                    .await
            }
        });
        while breaker.state() != CircuitState::HalfOpen {
            tokio::task::yield_now().await;
        }

        let second: Result<(), _> = breaker.call(async { Ok(()) }).await;
        assert!(matches!(second, Err(ProviderError::CircuitOpen("gemini"))));

        gate.notify_one();
        trial.await.unwrap().unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.call(async { Ok::<_, ProviderError>(()) }).await.unwrap();
    }

    #[tokio::test]
    async fn test_permanent_errors_do_not_trip() {
        let breaker = CircuitBreaker::new("openai", 1, Duration::from_secs(5));
        let _: Result<(), _> = breaker
            .call(async { Err(ProviderError::ContentBlocked("nsfw".into())) })
            .await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
