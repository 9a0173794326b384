//! Per-provider circuit breaker.
//!
//! Stops calling a metadata provider that keeps failing, then lets a single
//! probe through once the open timeout has elapsed.
//!
//! # Circuit States
//!
//! ```text
//! CLOSED --[N consecutive failures]--> OPEN --[open_timeout, lazily on allow()]--> HALF_OPEN
//!                                        ^                                             |
//!                                        +---------------[any failure]-----------------+
//!                                                                                      |
//! CLOSED <-------------------[success_threshold consecutive successes]-----------------+
//! ```

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::AppError;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected without contacting the provider.
    Open,
    /// One probe at a time is allowed to test recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit.
    pub failure_threshold: u32,

    /// Number of consecutive successes in half-open state to close the circuit.
    pub success_threshold: u32,

    /// Time since the last failure before Open becomes Half-Open.
    pub open_timeout: Duration,

    /// When a rate limit (429) opens the circuit, multiply open_timeout by this factor.
    pub rate_limit_backoff_multiplier: f32,

    /// Upper bound for the open timeout after rate limit extensions.
    pub max_open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
            rate_limit_backoff_multiplier: 2.0,
            max_open_timeout: Duration::from_secs(300),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, n: u32) -> Self {
        self.failure_threshold = n.max(1);
        self
    }

    pub fn with_success_threshold(mut self, n: u32) -> Self {
        self.success_threshold = n.max(1);
        self
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }
}

#[derive(Debug)]
struct CircuitBreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
    last_error_message: Option<String>,
    current_open_timeout: Duration,
    probe_in_flight: bool,
    trial_id: u64,
}

impl CircuitBreakerInner {
    fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            last_error_message: None,
            current_open_timeout: config.open_timeout,
            probe_in_flight: false,
            trial_id: 0,
        }
    }

    fn remaining_open_time(&self) -> Duration {
        self.last_failure_time
            .map(|t| self.current_open_timeout.saturating_sub(t.elapsed()))
            .unwrap_or(self.current_open_timeout)
    }
}

/// Snapshot of circuit breaker state for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_error: Option<String>,
    pub time_until_half_open: Option<Duration>,
}

/// Error type for [`CircuitBreaker::call`].
#[derive(Debug)]
pub enum CircuitBreakerError {
    /// Circuit is open - the operation was not executed.
    Open { name: String, retry_after: Duration },
    /// The operation ran and failed.
    Inner(AppError),
}

impl std::fmt::Display for CircuitBreakerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerError::Open { name, retry_after } => {
                write!(
                    f,
                    "Circuit breaker '{}' is open. Retry after {} seconds.",
                    name,
                    retry_after.as_secs()
                )
            }
            CircuitBreakerError::Inner(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CircuitBreakerError {}

impl From<CircuitBreakerError> for AppError {
    fn from(e: CircuitBreakerError) -> Self {
        match e {
            CircuitBreakerError::Open { name, .. } => AppError::CircuitOpen(name),
            CircuitBreakerError::Inner(inner) => inner,
        }
    }
}

/// Thread-safe circuit breaker; clones share state.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<CircuitBreakerInner>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let inner = CircuitBreakerInner::new(&config);
        Self {
            name: name.into(),
            config,
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquires the inner mutex lock, recovering from poison if necessary.
    fn lock_inner(&self) -> std::sync::MutexGuard<'_, CircuitBreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(circuit = %self.name, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    /// Returns the current state, handling lazy Open → HalfOpen transitions.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);
        inner.state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);

        let time_until_half_open =
            (inner.state == CircuitState::Open).then(|| inner.remaining_open_time());

        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_error: inner.last_error_message.clone(),
            time_until_half_open,
        }
    }

    /// May a call proceed right now?
    ///
    /// - Closed: always
    /// - Open: never
    /// - HalfOpen: only if no other probe is outstanding; the caller that
    ///   receives `true` owns the probe and must report its outcome.
    ///
    /// Prefer [`try_acquire`](Self::try_acquire) when the call can be
    /// cancelled before it reports back.
    pub fn allow(&self) -> bool {
        self.admit().is_some()
    }

    /// Like [`allow`](Self::allow), but the admission is held by a guard.
    ///
    /// Dropping the permit without recording an outcome hands the half-open
    /// slot back.
    pub fn try_acquire(&self) -> Option<CallPermit<'_>> {
        self.admit().map(|trial| CallPermit {
            breaker: self,
            trial,
            reported: false,
        })
    }

    /// `None` when rejected, `Some(Some(id))` for a half-open trial call.
    fn admit(&self) -> Option<Option<u64>> {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);

        match inner.state {
            CircuitState::Closed => Some(None),
            CircuitState::Open => None,
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    None
                } else {
                    inner.probe_in_flight = true;
                    inner.trial_id = inner.trial_id.wrapping_add(1);
                    Some(Some(inner.trial_id))
                }
            }
        }
    }

    fn release_trial(&self, trial: u64) {
        let mut inner = self.lock_inner();
        if inner.state == CircuitState::HalfOpen
            && inner.probe_in_flight
            && inner.trial_id == trial
        {
            tracing::debug!(circuit = %self.name, "Half-open call abandoned, slot released");
            inner.probe_in_flight = false;
        }
    }

    /// Report the outcome of an allowed call.
    pub fn record(&self, success: bool) {
        if success {
            self.record_success();
        } else {
            self.fail("call failed".to_string(), false);
        }
    }

    /// Report an outcome, letting the error decide whether it counts.
    ///
    /// Errors that do not trip the circuit (not-found, invalid request) mean
    /// the service answered; they release a half-open probe without moving
    /// any counter.
    pub fn record_outcome(&self, outcome: Result<(), &AppError>) {
        match outcome {
            Ok(()) => self.record_success(),
            Err(e) if e.should_trip_circuit() => self.record_failure(e),
            Err(_) => self.lock_inner().probe_in_flight = false,
        }
    }

    /// Executes the given operation through the circuit breaker.
    pub async fn call<F, T, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let Some(permit) = self.try_acquire() else {
            let retry_after = self.lock_inner().remaining_open_time();
            return Err(CircuitBreakerError::Open {
                name: self.name.clone(),
                retry_after,
            });
        };

        let result = operation().await;
        permit.record_outcome(result.as_ref().map(|_| ()));
        result.map_err(CircuitBreakerError::Inner)
    }

    pub fn record_success(&self) {
        let mut inner = self.lock_inner();

        match inner.state {
            CircuitState::HalfOpen => {
                inner.probe_in_flight = false;
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    tracing::info!(
                        circuit = %self.name,
                        "Circuit breaker closing after {} successful probes",
                        inner.success_count
                    );
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.last_error_message = None;
                    inner.current_open_timeout = self.config.open_timeout;
                }
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            // A call admitted before the circuit opened finished late.
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, error: &AppError) {
        self.fail(error.to_string(), error.is_rate_limit());
    }

    fn fail(&self, message: String, is_rate_limit: bool) {
        let mut inner = self.lock_inner();

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                inner.last_failure_time = Some(Instant::now());
                inner.last_error_message = Some(message);

                if inner.failure_count >= self.config.failure_threshold {
                    tracing::warn!(
                        circuit = %self.name,
                        failures = inner.failure_count,
                        error = ?inner.last_error_message,
                        "Circuit breaker opening after {} consecutive failures",
                        inner.failure_count
                    );
                    inner.state = CircuitState::Open;
                    inner.success_count = 0;
                    inner.probe_in_flight = false;

                    if is_rate_limit {
                        self.extend_open_timeout(&mut inner);
                    }
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(
                    circuit = %self.name,
                    error = %message,
                    "Circuit breaker probe failed, returning to open state"
                );
                inner.state = CircuitState::Open;
                inner.last_failure_time = Some(Instant::now());
                inner.last_error_message = Some(message);
                inner.success_count = 0;
                inner.probe_in_flight = false;

                if is_rate_limit {
                    self.extend_open_timeout(&mut inner);
                }
            }
            CircuitState::Open => {
                inner.last_error_message = Some(message);
            }
        }
    }

    fn extend_open_timeout(&self, inner: &mut CircuitBreakerInner) {
        inner.current_open_timeout = std::cmp::min(
            Duration::from_secs_f32(
                inner.current_open_timeout.as_secs_f32()
                    * self.config.rate_limit_backoff_multiplier,
            ),
            self.config.max_open_timeout,
        );
        tracing::info!(
            circuit = %self.name,
            open_timeout_secs = inner.current_open_timeout.as_secs(),
            "Extended open timeout due to rate limit"
        );
    }

    pub fn reset(&self) {
        let mut inner = self.lock_inner();
        tracing::info!(circuit = %self.name, "Circuit breaker manually reset");
        *inner = CircuitBreakerInner::new(&self.config);
    }

    fn maybe_transition_to_half_open(&self, inner: &mut CircuitBreakerInner) {
        if inner.state == CircuitState::Open
            && let Some(last_failure) = inner.last_failure_time
            && last_failure.elapsed() >= inner.current_open_timeout
        {
            tracing::info!(
                circuit = %self.name,
                "Circuit breaker transitioning to half-open state"
            );
            inner.state = CircuitState::HalfOpen;
            inner.success_count = 0;
            inner.probe_in_flight = false;
        }
    }
}

/// Admission handed out by [`CircuitBreaker::try_acquire`].
#[must_use = "dropping a permit without recording abandons the call"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: Option<u64>,
    reported: bool,
}

impl CallPermit<'_> {
    pub fn record_success(mut self) {
        self.reported = true;
        self.breaker.record_success();
    }

    pub fn record_outcome(mut self, outcome: Result<(), &AppError>) {
        self.reported = true;
        self.breaker.record_outcome(outcome);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.reported
            && let Some(trial) = self.trial
        {
            self.breaker.release_trial(trial);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config(failures: u32, successes: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: failures,
            success_threshold: successes,
            open_timeout: Duration::from_millis(5),
            ..Default::default()
        }
    }

    #[test]
    fn test_circuit_starts_closed() {
        let cb = CircuitBreaker::new("test", CircuitBreakerConfig::default());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow());
    }

    #[test]
    fn test_circuit_opens_after_exact_threshold() {
        let config = CircuitBreakerConfig::default().with_failure_threshold(3);
        let cb = CircuitBreaker::new("test", config);

        cb.record(false);
        cb.record(false);
        assert!(cb.allow());
        cb.record(false);

        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let cb = CircuitBreaker::new("test", CircuitBreakerConfig::default());

        for _ in 0..4 {
            cb.record_failure(&AppError::NetworkError("test".into()));
        }
        cb.record_success();
        for _ in 0..4 {
            cb.record_failure(&AppError::NetworkError("test".into()));
        }

        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_admits_exactly_one_probe() {
        let cb = CircuitBreaker::new("test", fast_config(1, 2));

        cb.record(false);
        assert!(!cb.allow());
        std::thread::sleep(Duration::from_millis(10));

        assert!(cb.allow());
        assert!(!cb.allow());
        assert!(!cb.allow());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_closes_after_success_threshold() {
        let cb = CircuitBreaker::new("test", fast_config(1, 2));

        cb.record(false);
        std::thread::sleep(Duration::from_millis(10));

        assert!(cb.allow());
        cb.record(true);
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        assert!(cb.allow());
        cb.record(true);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow());
        assert!(cb.allow());
    }

    #[test]
    fn test_half_open_reopens_on_failure() {
        let cb = CircuitBreaker::new("test", fast_config(1, 2));

        cb.record(false);
        std::thread::sleep(Duration::from_millis(10));

        assert!(cb.allow());
        cb.record(true);
        assert!(cb.allow());
        cb.record(false);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow());
    }

    #[test]
    fn test_non_tripping_error_releases_probe() {
        let cb = CircuitBreaker::new("test", fast_config(1, 2));

        cb.record(false);
        std::thread::sleep(Duration::from_millis(10));

        assert!(cb.allow());
        cb.record_outcome(Err(&AppError::NotFound("no such title".into())));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.stats().success_count, 0);
        assert!(cb.allow());
    }

    #[test]
    fn test_dropped_permit_releases_half_open_slot() {
        let cb = CircuitBreaker::new("test", fast_config(1, 2));

        cb.record(false);
        std::thread::sleep(Duration::from_millis(10));

        let permit = cb.try_acquire();
        assert!(permit.is_some());
        assert!(cb.try_acquire().is_none());

        drop(permit);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.try_acquire().is_some());
    }

    #[test]
    fn test_stale_permit_does_not_release_newer_admission() {
        let cb = CircuitBreaker::new("test", fast_config(1, 1));

        cb.record(false);
        std::thread::sleep(Duration::from_millis(10));
        let stale = cb.try_acquire().unwrap();

        // The trial is superseded: the circuit reopens and half-opens again.
        cb.record(false);
        std::thread::sleep(Duration::from_millis(10));
        let current = cb.try_acquire().unwrap();

        drop(stale);
        assert!(!cb.allow());

        current.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_recorded_permit_keeps_outcome() {
        let cb = CircuitBreaker::new("test", fast_config(1, 2));

        cb.record(false);
        std::thread::sleep(Duration::from_millis(10));

        cb.try_acquire()
            .unwrap()
            .record_outcome(Err(&AppError::NetworkError("reset".into())));
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_closed_permit_drop_is_a_no_op() {
        let cb = CircuitBreaker::new("test", fast_config(3, 1));

        cb.record(false);
        drop(cb.try_acquire());
        let stats = cb.stats();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failure_count, 1);
    }

    #[test]
    fn test_not_found_does_not_count_as_failure() {
        let config = CircuitBreakerConfig::default().with_failure_threshold(2);
        let cb = CircuitBreaker::new("test", config);

        for _ in 0..5 {
            cb.record_outcome(Err(&AppError::NotFound("x".into())));
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().failure_count, 0);
    }

    #[test]
    fn test_rate_limit_extends_open_timeout() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            open_timeout: Duration::from_secs(30),
            rate_limit_backoff_multiplier: 2.0,
            max_open_timeout: Duration::from_secs(300),
            ..Default::default()
        };
        let cb = CircuitBreaker::new("test", config);

        cb.record_failure(&AppError::RateLimitExceeded);

        let stats = cb.stats();
        assert_eq!(stats.state, CircuitState::Open);
        assert!(stats.time_until_half_open.unwrap() > Duration::from_secs(55));
    }

    #[test]
    fn test_rate_limit_backoff_capped_at_max() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 1,
            open_timeout: Duration::from_secs(200),
            rate_limit_backoff_multiplier: 2.0,
            max_open_timeout: Duration::from_secs(300),
        };
        let cb = CircuitBreaker::new("test", config);

        cb.record_failure(&AppError::RateLimitExceeded);

        let stats = cb.stats();
        assert!(stats.time_until_half_open.unwrap() <= Duration::from_secs(300));
    }

    #[test]
    fn test_manual_reset() {
        let config = CircuitBreakerConfig::default().with_failure_threshold(1);
        let cb = CircuitBreaker::new("test", config);

        cb.record_failure(&AppError::NetworkError("test".into()));
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.stats().last_error.is_none());
    }

    #[test]
    fn test_concurrent_failures_are_not_lost() {
        let config = CircuitBreakerConfig::default().with_failure_threshold(1000);
        let cb = CircuitBreaker::new("test", config);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cb = cb.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        cb.record(false);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(cb.stats().failure_count, 800);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_call_returns_open_error_when_circuit_open() {
        let config = CircuitBreakerConfig::default().with_failure_threshold(1);
        let cb = CircuitBreaker::new("test", config);
        cb.record_failure(&AppError::NetworkError("test".into()));

        let result = cb
            .call(|| async { Ok::<_, AppError>("should not execute".to_string()) })
            .await;

        assert!(matches!(result, Err(CircuitBreakerError::Open { .. })));
        let as_app: AppError = result.unwrap_err().into();
        assert!(matches!(as_app, AppError::CircuitOpen(_)));
    }

    #[tokio::test]
    async fn test_call_records_failure() {
        let config = CircuitBreakerConfig::default().with_failure_threshold(2);
        let cb = CircuitBreaker::new("test", config);

        let _ = cb
            .call(|| async { Err::<String, _>(AppError::Timeout(10)) })
            .await;

        assert_eq!(cb.stats().failure_count, 1);
    }
}
