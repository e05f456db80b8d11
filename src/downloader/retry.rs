//! Retry policy, pluggable backoff strategies and circuit breaker

use rand::Rng;
use std::fmt::Debug;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::config::{
    BACKOFF_BASE, BACKOFF_FACTOR, BACKOFF_MAX, CIRCUIT_FAILURE_THRESHOLD,
    CIRCUIT_RECOVERY_TIMEOUT, DEFAULT_MAX_ATTEMPTS, JITTER_RANGE, RATE_LIMIT_FALLBACK,
};
use crate::fetcher::retry_formatter::RetryContext;
use crate::fetcher::{FetcherError, FetcherResult};
use crate::shutdown::SharedShutdown;

/// Computes the delay before retry number `attempt` (1-based)
pub trait BackoffStrategy: Send + Sync + Debug {
    /// Delay to wait after `attempt` failed
    fn delay(&self, attempt: u32) -> Duration;
}

/// `base * factor^(attempt-1)`, capped at `max`
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// First delay
    pub base: Duration,
    /// Upper bound
    pub max: Duration,
    /// Growth factor per attempt
    pub factor: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: BACKOFF_BASE,
            max: BACKOFF_MAX,
            factor: BACKOFF_FACTOR,
        }
    }
}

impl BackoffStrategy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.base.as_secs_f64() * self.factor.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max.as_secs_f64()))
    }
}

/// `base + increment * (attempt-1)`, capped at `max`
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    /// First delay
    pub base: Duration,
    /// Added per attempt
    pub increment: Duration,
    /// Upper bound
    pub max: Duration,
}

impl Default for LinearBackoff {
    fn default() -> Self {
        Self {
            base: BACKOFF_BASE,
            increment: BACKOFF_BASE,
            max: BACKOFF_MAX,
        }
    }
}

impl BackoffStrategy for LinearBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let steps = attempt.saturating_sub(1);
        (self.base + self.increment.saturating_mul(steps)).min(self.max)
    }
}

/// Randomizes another strategy's delay by `+/- range` (relative)
#[derive(Debug, Clone)]
pub struct JitteredBackoff<B> {
    inner: B,
    range: f64,
}

impl<B: BackoffStrategy> JitteredBackoff<B> {
    /// Wrap `inner` with a relative jitter range in `[0, 1]`
    pub fn new(inner: B, range: f64) -> Self {
        Self {
            inner,
            range: range.clamp(0.0, 1.0),
        }
    }
}

impl<B: BackoffStrategy> BackoffStrategy for JitteredBackoff<B> {
    fn delay(&self, attempt: u32) -> Duration {
        let base = self.inner.delay(attempt).as_secs_f64();
        if self.range == 0.0 {
            return Duration::from_secs_f64(base);
        }
        let factor = 1.0 + rand::rng().random_range(-self.range..=self.range);
        Duration::from_secs_f64((base * factor).max(0.0))
    }
}

/// Retry loop for transient fetcher errors
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Arc<dyn BackoffStrategy>,
    rate_limit_fallback: Duration,
    shutdown: Option<SharedShutdown>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_ATTEMPTS,
            JitteredBackoff::new(ExponentialBackoff::default(), JITTER_RANGE),
        )
    }
}

impl RetryPolicy {
    /// Create a policy with `max_attempts` total attempts (at least one)
    pub fn new(max_attempts: u32, backoff: impl BackoffStrategy + 'static) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Arc::new(backoff),
            rate_limit_fallback: RATE_LIMIT_FALLBACK,
            shutdown: None,
        }
    }

    /// Override the delay used after a 429 without `Retry-After`
    pub fn with_rate_limit_fallback(mut self, fallback: Duration) -> Self {
        self.rate_limit_fallback = fallback;
        self
    }

    /// Abort backoff sleeps as soon as shutdown is requested
    pub fn with_shutdown(mut self, shutdown: SharedShutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Total attempts including the first
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay to apply after `error` on `attempt`
    pub fn delay_for(&self, error: &FetcherError, attempt: u32) -> Duration {
        match error {
            FetcherError::RateLimitError { retry_after } => {
                retry_after.unwrap_or(self.rate_limit_fallback)
            }
            _ => self.backoff.delay(attempt),
        }
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempts are exhausted. `op` receives the 1-based attempt number.
    pub async fn retry<T, F, Fut>(&self, label: &str, mut op: F) -> FetcherResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = FetcherResult<T>>,
    {
        let mut attempt = 1;
        loop {
            let err = match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(target_label = label, attempt, "Retry succeeded");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            let context = RetryContext::new(
                attempt,
                self.max_attempts,
                err.classify(),
                self.delay_for(&err, attempt),
                label,
                err.to_string(),
            );

            if !err.is_transient() {
                debug!(target_label = label, error = %err, "Not retrying non-transient error");
                return Err(err);
            }
            if attempt >= self.max_attempts {
                error!("{}", context.format_failure());
                return Err(err);
            }

            warn!("{}", context.format_retry());
            crate::metrics::record_retry(label, context.backoff_duration);
            if !self.pause(context.backoff_duration).await {
                debug!(target_label = label, "Shutdown requested during backoff");
                return Err(err);
            }
            attempt += 1;
        }
    }

    /// Sleep for `delay`; returns `false` when shutdown cut the wait short
    pub(crate) async fn pause(&self, delay: Duration) -> bool {
        match &self.shutdown {
            Some(shutdown) => {
                if shutdown.is_shutdown_requested() {
                    return false;
                }
                tokio::select! {
                    _ = tokio::time::sleep(delay) => true,
                    _ = shutdown.wait_for_shutdown() => false,
                }
            }
            None => {
                tokio::time::sleep(delay).await;
                true
            }
        }
    }
}

/// Observable breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow normally
    Closed,
    /// Calls are rejected until the recovery timeout elapses
    Open,
    /// One trial call is allowed through
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Guards a call site against a persistently failing upstream
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CIRCUIT_FAILURE_THRESHOLD, CIRCUIT_RECOVERY_TIMEOUT)
    }
}

impl CircuitBreaker {
    /// Create a breaker that opens after `failure_threshold` consecutive failures
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state, moving `Open` to `HalfOpen` once the timeout elapsed
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        inner.state
    }

    fn refresh(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= self.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = false;
                }
            }
        }
    }

    /// Ask permission to issue a call
    pub fn try_acquire(&self) -> FetcherResult<()> {
        self.acquire().map(|_| ())
    }

    /// Like [`try_acquire`](Self::try_acquire), reporting whether the
    /// half-open trial slot was taken
    fn acquire(&self) -> FetcherResult<bool> {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                debug!("Circuit half-open, allowing trial call");
                Ok(true)
            }
            CircuitState::HalfOpen => Err(FetcherError::CircuitOpen(
                "trial call already in flight".to_string(),
            )),
            CircuitState::Open => {
                let retry_in = inner
                    .opened_at
                    .map(|t| self.recovery_timeout.saturating_sub(t.elapsed()))
                    .unwrap_or(self.recovery_timeout);
                Err(FetcherError::CircuitOpen(format!(
                    "retry in {:.1}s",
                    retry_in.as_secs_f64()
                )))
            }
        }
    }

    /// Record a successful call; closes the circuit
    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            info!("Circuit closed after successful call");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    /// Record a failed call; may open the circuit
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        let reopen = inner.state == CircuitState::HalfOpen
            || inner.consecutive_failures >= self.failure_threshold;
        if reopen && inner.state != CircuitState::Open {
            warn!(
                consecutive_failures = inner.consecutive_failures,
                recovery_secs = self.recovery_timeout.as_secs(),
                "Circuit opened"
            );
        }
        if reopen {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.trial_in_flight = false;
        }
    }

    /// Run `fut` through the breaker.
    ///
    /// Only transient errors count as failures; an upstream that answers with a
    /// definitive error is considered reachable.
    pub async fn call<T, Fut>(&self, fut: Fut) -> FetcherResult<T>
    where
        Fut: Future<Output = FetcherResult<T>>,
    {
        let trial = TrialSlot {
            breaker: self,
            held: self.acquire()?,
        };
        let outcome = fut.await;
        trial.settle();
        match outcome {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) if err.is_transient() => {
                self.record_failure();
                Err(err)
            }
            Err(err) => {
                self.record_success();
                Err(err)
            }
        }
    }
}

/// Frees the half-open trial slot if the call is dropped before it settles
struct TrialSlot<'a> {
    breaker: &'a CircuitBreaker,
    held: bool,
}

impl TrialSlot<'_> {
    fn settle(mut self) {
        self.held = false;
    }
}

impl Drop for TrialSlot<'_> {
    fn drop(&mut self) {
        if self.held {
            let mut inner = self.breaker.lock();
            if inner.state == CircuitState::HalfOpen {
                inner.trial_in_flight = false;
                debug!("Trial call abandoned, slot released");
            }
        }
    }
}
