//! Circuit breaker guarding calls to the subject service
//!
//! # States
//!
//! - **Closed**: Normal operation, requests pass through. Counters are cleared
//!   every `interval` (when non-zero).
//! - **Open**: Circuit is tripped, requests fail immediately with
//!   [`CircuitBreakerError::Open`] until `timeout` elapses.
//! - **Half-Open**: At most `max_requests` probes are let through; further
//!   calls fail with [`CircuitBreakerError::Busy`]. `max_requests` consecutive
//!   successes close the circuit, any failure re-opens it.
//!
//! The breaker trips when `consecutive_failures` failures happen in a row, or
//! when `total_failures_per_interval` failures accumulate within one interval.
//!
//! Each admitted call carries the generation it was admitted in. Outcomes from
//! an older generation (the state changed while the call was in flight) are
//! ignored. An [`Admission`] dropped without an outcome hands its slot back.
//!
//! # Example
//!
//! ```rust,ignore
//! use drover::prelude::*;
//!
//! let breaker = CircuitBreaker::with_config(CircuitBreakerConfig::default());
//!
//! let admission = breaker.admit()?;
//! let status = send(&request).await;
//! admission.record(status < 500);
//! ```

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - requests pass through
    Closed,
    /// Circuit is open - requests fail immediately
    Open,
    /// Testing if service has recovered
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Probes allowed in half-open state (also the successes needed to close)
    pub max_requests: u32,
    /// Closed-state counter window; zero never clears the counters
    pub interval: Duration,
    /// Time spent open before probing
    pub timeout: Duration,
    /// Consecutive failures that trip the circuit (0 disables the rule)
    pub consecutive_failures: u32,
    /// Failures within one interval that trip the circuit (0 disables the rule)
    pub total_failures_per_interval: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_requests: 1,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
            consecutive_failures: 5,
            total_failures_per_interval: 0,
        }
    }
}

/// Request counters for the current generation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests += 1;
    }

    fn on_success(&mut self) {
        self.total_successes += 1;
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
    }
}

/// Rejection returned by the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CircuitBreakerError {
    /// Circuit is open, request was rejected
    #[error("circuit breaker is open")]
    Open,
    /// Half-open probe limit reached, request was rejected
    #[error("circuit breaker is half-open and busy")]
    Busy,
}

/// Ticket for an admitted call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permit {
    generation: u64,
}

/// An admitted call that has not reported its outcome yet.
///
/// Dropping it unrecorded (a cancelled call) releases the slot instead of
/// counting a success or a failure.
#[must_use = "record the outcome or drop to release the slot"]
#[derive(Debug)]
pub struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    permit: Option<Permit>,
}

impl Admission<'_> {
    /// Report the outcome of the admitted call
    pub fn record(mut self, success: bool) {
        if let Some(permit) = self.permit.take() {
            self.breaker.record(permit, success);
        }
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.breaker.release(permit);
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    generation: u64,
    counts: Counts,
    expiry: Option<Instant>,
}

/// Circuit breaker for protecting the subject against overload
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::with_config(CircuitBreakerConfig::default())
    }
}

impl CircuitBreaker {
    /// Create a circuit breaker with custom configuration
    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        let now = Instant::now();
        let mut inner = BreakerState {
            state: CircuitState::Closed,
            generation: 0,
            counts: Counts::default(),
            expiry: None,
        };
        inner.expiry = Self::closed_expiry(&config, now);
        Self {
            config,
            inner: Mutex::new(inner),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get the current state
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, Instant::now());
        inner.state
    }

    /// Get a snapshot of the current counters
    pub fn counts(&self) -> Counts {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, Instant::now());
        inner.counts
    }

    /// Try to admit one call
    pub fn allow(&self) -> Result<Permit, CircuitBreakerError> {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, Instant::now());

        match inner.state {
            CircuitState::Open => return Err(CircuitBreakerError::Open),
            CircuitState::HalfOpen if inner.counts.requests >= self.config.max_requests => {
                return Err(CircuitBreakerError::Busy);
            }
            _ => {}
        }

        inner.counts.on_request();
        Ok(Permit {
            generation: inner.generation,
        })
    }

    /// Report the outcome of an admitted call
    pub fn record(&self, permit: Permit, success: bool) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now);

        if permit.generation != inner.generation {
            return;
        }

        if success {
            self.on_success(&mut inner, now);
        } else {
            self.on_failure(&mut inner, now);
        }
    }

    /// Admit one call, handing back a guard that reports or releases it
    pub fn admit(&self) -> Result<Admission<'_>, CircuitBreakerError> {
        let permit = self.allow()?;
        Ok(Admission {
            breaker: self,
            permit: Some(permit),
        })
    }

    /// Give back the slot of an admitted call that never finished
    pub fn release(&self, permit: Permit) {
        let mut inner = self.inner.lock();
        if permit.generation == inner.generation {
            inner.counts.requests = inner.counts.requests.saturating_sub(1);
        }
    }

    /// Manually reset the circuit breaker
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitState::Closed, Instant::now());
    }

    /// Manually open the circuit breaker
    pub fn trip(&self) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitState::Open, Instant::now());
    }

    fn ready_to_trip(&self, counts: &Counts) -> bool {
        let consecutive = self.config.consecutive_failures > 0
            && counts.consecutive_failures >= self.config.consecutive_failures;
        let total = self.config.total_failures_per_interval > 0
            && counts.total_failures >= self.config.total_failures_per_interval;
        consecutive || total
    }

    fn on_success(&self, inner: &mut BreakerState, now: Instant) {
        match inner.state {
            CircuitState::Closed => inner.counts.on_success(),
            CircuitState::HalfOpen => {
                inner.counts.on_success();
                if inner.counts.consecutive_successes >= self.config.max_requests {
                    self.transition(inner, CircuitState::Closed, now);
                    tracing::info!("Circuit breaker closed (subject recovered)");
                }
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, inner: &mut BreakerState, now: Instant) {
        match inner.state {
            CircuitState::Closed => {
                inner.counts.on_failure();
                if self.ready_to_trip(&inner.counts) {
                    let counts = inner.counts;
                    self.transition(inner, CircuitState::Open, now);
                    tracing::warn!(
                        consecutive_failures = counts.consecutive_failures,
                        total_failures = counts.total_failures,
                        "Circuit breaker OPEN"
                    );
                }
            }
            CircuitState::HalfOpen => {
                self.transition(inner, CircuitState::Open, now);
                tracing::warn!("Circuit breaker re-opened after failed probe");
            }
            CircuitState::Open => {}
        }
    }

    /// Apply time-based transitions (interval rollover, open timeout)
    fn refresh(&self, inner: &mut BreakerState, now: Instant) {
        match inner.state {
            CircuitState::Closed => {
                if inner.expiry.is_some_and(|expiry| expiry <= now) {
                    self.new_generation(inner, now);
                }
            }
            CircuitState::Open => {
                if inner.expiry.is_some_and(|expiry| expiry <= now) {
                    self.transition(inner, CircuitState::HalfOpen, now);
                }
            }
            CircuitState::HalfOpen => {}
        }
    }

    fn transition(&self, inner: &mut BreakerState, state: CircuitState, now: Instant) {
        if inner.state == state {
            return;
        }
        inner.state = state;
        self.new_generation(inner, now);
    }

    fn new_generation(&self, inner: &mut BreakerState, now: Instant) {
        inner.generation = inner.generation.wrapping_add(1);
        inner.counts = Counts::default();
        inner.expiry = match inner.state {
            CircuitState::Closed => Self::closed_expiry(&self.config, now),
            CircuitState::Open => Some(now + self.config.timeout),
            CircuitState::HalfOpen => None,
        };
    }

    fn closed_expiry(config: &CircuitBreakerConfig, now: Instant) -> Option<Instant> {
        if config.interval.is_zero() {
            None
        } else {
            Some(now + config.interval)
        }
    }
}

/// A shared circuit breaker that can be cloned
#[derive(Debug, Clone)]
pub struct SharedCircuitBreaker {
    inner: Arc<CircuitBreaker>,
}

impl SharedCircuitBreaker {
    /// Create with custom configuration
    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Arc::new(CircuitBreaker::with_config(config)),
        }
    }
}

impl std::ops::Deref for SharedCircuitBreaker {
    type Target = CircuitBreaker;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(consecutive: u32) -> CircuitBreaker {
        CircuitBreaker::with_config(CircuitBreakerConfig {
            max_requests: 2,
            interval: Duration::ZERO,
            timeout: Duration::from_millis(50),
            consecutive_failures: consecutive,
            total_failures_per_interval: 0,
        })
    }

    fn fail(breaker: &CircuitBreaker) {
        let permit = breaker.allow().unwrap();
        breaker.record(permit, false);
    }

    fn succeed(breaker: &CircuitBreaker) {
        let permit = breaker.allow().unwrap();
        breaker.record(permit, true);
    }

    #[test]
    fn test_circuit_breaker_initial_state() {
        let breaker = breaker(3);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow().is_ok());
    }

    #[test]
    fn test_circuit_breaker_opens_after_consecutive_failures() {
        let breaker = breaker(3);

        fail(&breaker);
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Closed);

        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(breaker.allow(), Err(CircuitBreakerError::Open)));
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let breaker = breaker(3);

        fail(&breaker);
        fail(&breaker);
        succeed(&breaker);
        assert_eq!(breaker.counts().consecutive_failures, 0);

        fail(&breaker);
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_total_failures_per_interval_trips() {
        let breaker = CircuitBreaker::with_config(CircuitBreakerConfig {
            max_requests: 1,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(60),
            consecutive_failures: 0,
            total_failures_per_interval: 3,
        });

        fail(&breaker);
        succeed(&breaker);
        fail(&breaker);
        succeed(&breaker);
        assert_eq!(breaker.state(), CircuitState::Closed);

        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_half_open_limits_probes() {
        let breaker = breaker(1);
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let p1 = breaker.allow().unwrap();
        let p2 = breaker.allow().unwrap();
        assert!(matches!(breaker.allow(), Err(CircuitBreakerError::Busy)));

        breaker.record(p1, true);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record(p2, true);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = breaker(1);
        fail(&breaker);
        std::thread::sleep(Duration::from_millis(60));

        let probe = breaker.allow().unwrap();
        breaker.record(probe, false);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_stale_generation_is_ignored() {
        let breaker = breaker(1);
        let stale = breaker.allow().unwrap();
        breaker.trip();
        breaker.reset();

        breaker.record(stale, false);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.counts().total_failures, 0);
    }

    #[test]
    fn test_admission_records_outcome() {
        let breaker = breaker(1);
        breaker.admit().unwrap().record(false);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.admit().unwrap_err(), CircuitBreakerError::Open);
    }

    #[test]
    fn test_dropped_admission_frees_half_open_slot() {
        let breaker = CircuitBreaker::with_config(CircuitBreakerConfig {
            max_requests: 1,
            interval: Duration::ZERO,
            timeout: Duration::from_millis(20),
            consecutive_failures: 1,
            total_failures_per_interval: 0,
        });
        fail(&breaker);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let abandoned = breaker.admit().unwrap();
        assert_eq!(breaker.allow().unwrap_err(), CircuitBreakerError::Busy);
        drop(abandoned);

        // neither a success nor a failure was counted
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.counts(), Counts::default());

        breaker.admit().unwrap().record(true);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_shared_circuit_breaker() {
        let breaker = SharedCircuitBreaker::with_config(CircuitBreakerConfig::default());
        let breaker2 = breaker.clone();

        fail(&breaker);
        assert_eq!(breaker2.counts().consecutive_failures, 1);
    }
}
