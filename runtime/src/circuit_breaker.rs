//! Circuit breaker for calls to a downstream service.
//!
//! A circuit breaker watches the outcome of calls and "opens" (stops
//! attempting them) when too many fail, so a struggling dependency is not
//! hammered and callers get an immediate, typed answer instead of waiting on
//! timeouts.
//!
//! # States
//!
//! - **Closed**: Calls pass through. Failures are counted in a rolling window.
//! - **Open**: The failure threshold was reached inside the window. Calls are
//!   rejected without being attempted until the cooldown elapses.
//! - **HalfOpen**: The cooldown elapsed. Exactly one trial call is let
//!   through; concurrent callers are rejected while it runs. Success closes
//!   the circuit, failure opens it again.
//!
//! State is shared by every clone of a breaker and guarded by a mutex that is
//! never held across an `.await`.
//!
//! # Example
//!
//! ```rust
//! use parkflow_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let config = CircuitBreakerConfig::builder()
//!     .failure_threshold(5)
//!     .window(Duration::from_secs(30))
//!     .cooldown(Duration::from_secs(10))
//!     .build();
//!
//! let breaker = CircuitBreaker::new("user-service", config);
//!
//! match breaker.call(|| async { Ok::<_, String>(42) }).await {
//!     Ok(result) => println!("Success: {result}"),
//!     Err(e) => println!("Failed: {e}"),
//! }
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures inside `window` that open the circuit
    pub failure_threshold: usize,
    /// Length of the rolling failure window
    pub window: Duration,
    /// How long the circuit stays open before a trial call is allowed
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub const fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder {
            failure_threshold: 5,
            window: Duration::from_secs(30),
            cooldown: Duration::from_secs(10),
        }
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfigBuilder {
    failure_threshold: usize,
    window: Duration,
    cooldown: Duration,
}

impl CircuitBreakerConfigBuilder {
    /// Set the failure threshold.
    ///
    /// The circuit opens once this many failures fall inside the window.
    /// Values below 1 are treated as 1.
    #[must_use]
    pub const fn failure_threshold(mut self, threshold: usize) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the rolling window over which failures are counted.
    #[must_use]
    pub const fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Set how long to stay Open before trying `HalfOpen`.
    #[must_use]
    pub const fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Build the configuration.
    #[must_use]
    pub const fn build(self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: if self.failure_threshold == 0 { 1 } else { self.failure_threshold },
            window: self.window,
            cooldown: self.cooldown,
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Circuit is closed, requests pass through normally
    Closed,
    /// Circuit is open, requests fail immediately
    Open,
    /// Circuit is half-open, one trial request is allowed
    HalfOpen,
}

impl State {
    /// Gauge value: 0 closed, 1 half-open, 2 open.
    #[must_use]
    pub const fn as_gauge(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

/// Errors from circuit breaker operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open (or a half-open trial is in flight); the call was not attempted
    #[error("Circuit breaker is open")]
    Open,
    /// The call was attempted and failed
    #[error("Operation failed: {0}")]
    Inner(E),
}

#[derive(Debug)]
struct Inner {
    state: State,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Trial,
}

/// Circuit breaker for one downstream service.
///
/// Cloning is cheap and clones share state, so one breaker can be handed to
/// every caller of the same service.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: Arc<CircuitBreakerConfig>,
    inner: Arc<Mutex<Inner>>,
    // Metrics
    total_calls: Arc<AtomicU64>,
    total_successes: Arc<AtomicU64>,
    total_failures: Arc<AtomicU64>,
    total_rejections: Arc<AtomicU64>,
}

impl CircuitBreaker {
    /// Create a closed circuit breaker for the named service.
    #[must_use]
    pub fn new(name: impl Into<Arc<str>>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config: Arc::new(config),
            inner: Arc::new(Mutex::new(Inner {
                state: State::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                trial_in_flight: false,
            })),
            total_calls: Arc::new(AtomicU64::new(0)),
            total_successes: Arc::new(AtomicU64::new(0)),
            total_failures: Arc::new(AtomicU64::new(0)),
            total_rejections: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Name of the protected service.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the current state of the circuit breaker.
    ///
    /// An Open circuit whose cooldown has elapsed still reports Open until the
    /// next call moves it to `HalfOpen`.
    #[must_use]
    pub fn state(&self) -> State {
        self.lock().state
    }

    /// Call an operation through the circuit breaker.
    ///
    /// # Errors
    ///
    /// Returns `CircuitBreakerError::Open` if the call was short-circuited.
    /// Returns `CircuitBreakerError::Inner` if the operation fails.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        let Some(admission) = self.admit() else {
            self.total_rejections.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(service = %self.name, "Circuit breaker is OPEN, rejecting request");
            return Err(CircuitBreakerError::Open);
        };

        // Releases the half-open trial slot if the caller drops this future mid-call.
        let mut trial = TrialGuard {
            breaker: self,
            armed: admission == Admission::Trial,
        };

        let outcome = operation().await;
        trial.armed = false;

        match outcome {
            Ok(result) => {
                self.on_success(admission);
                self.total_successes.fetch_add(1, Ordering::Relaxed);
                Ok(result)
            }
            Err(err) => {
                self.on_failure(admission);
                self.total_failures.fetch_add(1, Ordering::Relaxed);
                Err(CircuitBreakerError::Inner(err))
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decide whether a call may proceed, moving Open → `HalfOpen` after the cooldown.
    fn admit(&self) -> Option<Admission> {
        let mut inner = self.lock();

        match inner.state {
            State::Closed => Some(Admission::Normal),
            State::HalfOpen if inner.trial_in_flight => None,
            State::HalfOpen => {
                inner.trial_in_flight = true;
                Some(Admission::Trial)
            }
            State::Open => {
                let cooled_down = inner
                    .opened_at
                    .is_none_or(|opened| opened.elapsed() >= self.config.cooldown);
                if !cooled_down {
                    return None;
                }
                tracing::info!(service = %self.name, "Circuit breaker transitioning OPEN -> HALF_OPEN");
                self.transition(&mut inner, State::HalfOpen);
                inner.trial_in_flight = true;
                Some(Admission::Trial)
            }
        }
    }

    fn on_success(&self, admission: Admission) {
        let mut inner = self.lock();

        if admission == Admission::Trial {
            tracing::info!(service = %self.name, "Circuit breaker transitioning HALF_OPEN -> CLOSED");
            inner.trial_in_flight = false;
            inner.failures.clear();
            inner.opened_at = None;
            self.transition(&mut inner, State::Closed);
        }
    }

    fn on_failure(&self, admission: Admission) {
        let mut inner = self.lock();
        let now = Instant::now();

        if admission == Admission::Trial {
            tracing::warn!(service = %self.name, "Circuit breaker transitioning HALF_OPEN -> OPEN (trial failed)");
            inner.trial_in_flight = false;
            inner.opened_at = Some(now);
            self.transition(&mut inner, State::Open);
            return;
        }

        // A call admitted while Closed may finish after the circuit already opened.
        if inner.state != State::Closed {
            return;
        }

        inner.failures.push_back(now);
        while inner
            .failures
            .front()
            .is_some_and(|at| now.duration_since(*at) > self.config.window)
        {
            inner.failures.pop_front();
        }

        if inner.failures.len() >= self.config.failure_threshold {
            tracing::warn!(
                service = %self.name,
                failures = inner.failures.len(),
                threshold = self.config.failure_threshold,
                window_ms = self.config.window.as_millis(),
                "Circuit breaker transitioning CLOSED -> OPEN"
            );
            inner.failures.clear();
            inner.opened_at = Some(now);
            self.transition(&mut inner, State::Open);
        }
    }

    fn transition(&self, inner: &mut Inner, to: State) {
        inner.state = to;
        metrics::gauge!("circuit_breaker_state", "service" => self.name.to_string()).set(to.as_gauge());
    }

    /// Get circuit breaker metrics.
    #[must_use]
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        CircuitBreakerMetrics {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
        }
    }

    /// Force the circuit open, as if the threshold had just been reached.
    pub fn trip(&self) {
        let mut inner = self.lock();
        tracing::warn!(service = %self.name, "Circuit breaker manually tripped to OPEN");
        inner.failures.clear();
        inner.trial_in_flight = false;
        inner.opened_at = Some(Instant::now());
        self.transition(&mut inner, State::Open);
    }

    /// Reset the circuit breaker to closed state.
    pub fn reset(&self) {
        let mut inner = self.lock();
        tracing::info!(service = %self.name, "Circuit breaker manually reset to CLOSED");
        inner.failures.clear();
        inner.trial_in_flight = false;
        inner.opened_at = None;
        self.transition(&mut inner, State::Closed);
    }
}

struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.lock().trial_in_flight = false;
        }
    }
}

/// Metrics for circuit breaker monitoring.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerMetrics {
    /// Total number of calls attempted
    pub total_calls: u64,
    /// Total number of successful calls
    pub total_successes: u64,
    /// Total number of failed calls
    pub total_failures: u64,
    /// Total number of rejected calls (circuit open)
    pub total_rejections: u64,
}

impl CircuitBreakerMetrics {
    /// Calculate rejection rate (0.0 to 1.0).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn rejection_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 0.0;
        }
        self.total_rejections as f64 / self.total_calls as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn breaker(threshold: usize, cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig::builder()
                .failure_threshold(threshold)
                .window(Duration::from_secs(60))
                .cooldown(Duration::from_millis(cooldown_ms))
                .build(),
        )
    }

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker.call(|| async { Err::<i32, _>("error") }).await;
    }

    #[tokio::test]
    async fn test_circuit_breaker_closed_on_success() {
        let breaker = CircuitBreaker::new("test", CircuitBreakerConfig::default());

        let result = breaker.call(|| async { Ok::<_, String>(42) }).await;

        assert_eq!(result, Ok(42));
        assert_eq!(breaker.state(), State::Closed);
    }

    #[tokio::test]
    async fn test_circuit_breaker_opens_after_threshold() {
        let breaker = breaker(3, 1_000);

        for _ in 0..3 {
            fail(&breaker).await;
        }

        assert_eq!(breaker.state(), State::Open);
    }

    #[tokio::test]
    async fn test_failures_outside_window_are_forgotten() {
        let breaker = CircuitBreaker::new(
            "test",
            CircuitBreakerConfig::builder()
                .failure_threshold(2)
                .window(Duration::from_millis(50))
                .build(),
        );

        fail(&breaker).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        fail(&breaker).await;

        assert_eq!(breaker.state(), State::Closed);
    }

    #[tokio::test]
    async fn test_open_circuit_does_not_attempt_call() {
        let breaker = breaker(2, 10_000);
        for _ in 0..2 {
            fail(&breaker).await;
        }

        let attempted = AtomicUsize::new(0);
        let result = breaker
            .call(|| async {
                attempted.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(42)
            })
            .await;

        assert_eq!(result, Err(CircuitBreakerError::Open));
        assert_eq!(attempted.load(Ordering::SeqCst), 0);
        assert_eq!(breaker.metrics().total_rejections, 1);
    }

    #[tokio::test]
    async fn test_half_open_success_closes() {
        let breaker = breaker(2, 100);
        for _ in 0..2 {
            fail(&breaker).await;
        }

        tokio::time::sleep(Duration::from_millis(150)).await;
        let result = breaker.call(|| async { Ok::<_, String>(42) }).await;

        assert_eq!(result, Ok(42));
        assert_eq!(breaker.state(), State::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = breaker(2, 100);
        for _ in 0..2 {
            fail(&breaker).await;
        }

        tokio::time::sleep(Duration::from_millis(150)).await;
        fail(&breaker).await;

        assert_eq!(breaker.state(), State::Open);
        let result = breaker.call(|| async { Ok::<_, String>(1) }).await;
        assert_eq!(result, Err(CircuitBreakerError::Open));
    }

    #[tokio::test]
    async fn test_half_open_admits_single_trial() {
        let breaker = breaker(1, 50);
        fail(&breaker).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial_breaker = breaker.clone();
        let trial = tokio::spawn(async move {
            trial_breaker
                .call(|| async move {
                    let _ = release_rx.await;
                    Ok::<_, String>("trial")
                })
                .await
        });

        // Wait until the trial call has been admitted.
        while breaker.state() != State::HalfOpen {
            tokio::task::yield_now().await;
        }

        let concurrent = breaker.call(|| async { Ok::<_, String>("other") }).await;
        assert_eq!(concurrent, Err(CircuitBreakerError::Open));

        let _ = release_tx.send(());
        assert_eq!(trial.await.ok(), Some(Ok("trial")));
        assert_eq!(breaker.state(), State::Closed);
    }

    #[tokio::test]
    async fn test_cancelled_trial_releases_slot() {
        let breaker = breaker(1, 50);
        fail(&breaker).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let pending = breaker.call(|| std::future::pending::<Result<(), String>>());
        let timed_out = tokio::time::timeout(Duration::from_millis(20), pending).await;
        assert!(timed_out.is_err());
        assert_eq!(breaker.state(), State::HalfOpen);

        let result = breaker.call(|| async { Ok::<_, String>(7) }).await;
        assert_eq!(result, Ok(7));
        assert_eq!(breaker.state(), State::Closed);
    }

    #[tokio::test]
    async fn test_trip_and_reset() {
        let breaker = breaker(5, 10_000);

        breaker.trip();
        assert_eq!(breaker.state(), State::Open);

        breaker.reset();
        assert_eq!(breaker.state(), State::Closed);
    }

    #[tokio::test]
    async fn test_circuit_breaker_concurrent_calls() {
        let breaker = CircuitBreaker::new("test", CircuitBreakerConfig::default());
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];

        for _ in 0..100 {
            let breaker = breaker.clone();
            let counter = Arc::clone(&counter);
            handles.push(tokio::spawn(async move {
                let _ = breaker
                    .call(|| async {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, String>(())
                    })
                    .await;
            }));
        }

        for handle in handles {
            handle.await.ok();
        }

        let metrics = breaker.metrics();
        assert_eq!(metrics.total_calls, 100);
        assert_eq!(metrics.total_successes, 100);
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }
}
