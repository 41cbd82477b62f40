//! Per-endpoint circuit breaker.
//!
//! - CLOSED: requests flow through
//! - OPEN: requests are rejected until the recovery timeout has elapsed
//!   since the last failure
//! - HALF_OPEN: exactly one trial request is let through; its outcome
//!   closes or reopens the circuit

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Time after the last failure before a trial request is allowed.
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct Timing {
    state: CircuitState,
    last_failure: Option<Instant>,
    state_since: Instant,
}

/// How a request was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Normal,
    /// The single half-open trial request.
    Trial,
}

/// Circuit breaker guarding one endpoint.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    timing: RwLock<Timing>,
    /// Consecutive failure count (reset on success).
    failure_count: AtomicU32,
    total_failures: AtomicU64,
    total_successes: AtomicU64,
    /// Set once the half-open trial has been handed out.
    trial_in_flight: AtomicBool,
    endpoint: String,
}

impl CircuitBreaker {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_config(endpoint, CircuitBreakerConfig::default())
    }

    pub fn with_config(endpoint: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            timing: RwLock::new(Timing {
                state: CircuitState::Closed,
                last_failure: None,
                state_since: Instant::now(),
            }),
            failure_count: AtomicU32::new(0),
            total_failures: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            trial_in_flight: AtomicBool::new(false),
            endpoint: endpoint.into(),
        }
    }

    /// Current state, moving OPEN to HALF_OPEN once the recovery timeout
    /// has elapsed.
    pub fn state(&self) -> CircuitState {
        self.maybe_transition_to_half_open();
        self.timing.read().unwrap_or_else(PoisonError::into_inner).state
    }

    /// Check whether a request may go through. In HALF_OPEN only the first
    /// caller gets `true` until the trial's outcome is recorded.
    pub fn allow_request(&self) -> bool {
        self.admit().is_some()
    }

    /// Like [`allow_request`](Self::allow_request), but tells the caller
    /// whether it holds the half-open trial. A trial holder must record an
    /// outcome or call [`release_trial`](Self::release_trial).
    pub fn admit(&self) -> Option<Admission> {
        match self.state() {
            CircuitState::Closed => Some(Admission::Normal),
            CircuitState::Open => None,
            CircuitState::HalfOpen => self
                .trial_in_flight
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .ok()
                .map(|_| Admission::Trial),
        }
    }

    /// Hand the half-open trial back without an outcome, so the next
    /// caller may try instead.
    pub fn release_trial(&self) {
        let timing = self.timing.read().unwrap_or_else(PoisonError::into_inner);
        if timing.state == CircuitState::HalfOpen
            && self.trial_in_flight.swap(false, Ordering::SeqCst)
        {
            debug!("Circuit breaker for {} trial released", self.endpoint);
        }
    }

    pub fn record_success(&self) {
        self.total_successes.fetch_add(1, Ordering::SeqCst);
        self.failure_count.store(0, Ordering::SeqCst);

        let mut timing = self.timing.write().unwrap_or_else(PoisonError::into_inner);
        if timing.state != CircuitState::Closed {
            timing.state = CircuitState::Closed;
            timing.state_since = Instant::now();
            self.trial_in_flight.store(false, Ordering::SeqCst);
            info!("Circuit breaker for {} recovered to CLOSED", self.endpoint);
        }
    }

    pub fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::SeqCst);
        let failures = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;

        let mut timing = self.timing.write().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        timing.last_failure = Some(now);
        match timing.state {
            CircuitState::Closed if failures >= self.config.failure_threshold => {
                timing.state = CircuitState::Open;
                timing.state_since = now;
                warn!(
                    "Circuit breaker for {} opened after {} failures",
                    self.endpoint, failures
                );
            }
            CircuitState::HalfOpen => {
                // Trial failed; the recovery timer restarts from now
                timing.state = CircuitState::Open;
                timing.state_since = now;
                self.trial_in_flight.store(false, Ordering::SeqCst);
                warn!("Circuit breaker for {} trial failed, reopening", self.endpoint);
            }
            _ => {}
        }
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let state = self.state();
        let timing = self.timing.read().unwrap_or_else(PoisonError::into_inner);
        CircuitBreakerStats {
            endpoint: self.endpoint.clone(),
            state,
            failure_count: self.failure_count.load(Ordering::SeqCst),
            total_failures: self.total_failures.load(Ordering::SeqCst),
            total_successes: self.total_successes.load(Ordering::SeqCst),
            time_in_state: timing.state_since.elapsed(),
        }
    }

    /// Force the circuit back to CLOSED.
    pub fn reset(&self) {
        self.failure_count.store(0, Ordering::SeqCst);
        self.trial_in_flight.store(false, Ordering::SeqCst);
        let mut timing = self.timing.write().unwrap_or_else(PoisonError::into_inner);
        timing.state = CircuitState::Closed;
        timing.last_failure = None;
        timing.state_since = Instant::now();
        info!("Circuit breaker for {} reset to CLOSED", self.endpoint);
    }

    fn maybe_transition_to_half_open(&self) {
        {
            let timing = self.timing.read().unwrap_or_else(PoisonError::into_inner);
            if timing.state != CircuitState::Open {
                return;
            }
        }
        let mut timing = self.timing.write().unwrap_or_else(PoisonError::into_inner);
        let recovered = timing
            .last_failure
            .map(|t| t.elapsed() >= self.config.recovery_timeout)
            .unwrap_or(true);
        if timing.state == CircuitState::Open && recovered {
            timing.state = CircuitState::HalfOpen;
            timing.state_since = Instant::now();
            self.trial_in_flight.store(false, Ordering::SeqCst);
            debug!("Circuit breaker for {} entering HALF_OPEN", self.endpoint);
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub endpoint: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub time_in_state: Duration,
}
