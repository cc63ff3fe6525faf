//! Circuit breaker for upstream protection.
//!
//! # States
//! - Closed: normal operation, calls pass through
//! - Open: upstream assumed down, calls fail fast
//! - HalfOpen: probing whether the upstream recovered
//!
//! # State transitions
//! ```text
//! Closed   → Open:     failure_threshold consecutive failures
//! Open     → HalfOpen: first acquire at or after last_failure + open_duration
//! HalfOpen → Closed:   success_threshold consecutive successes
//! HalfOpen → Open:     any single failure
//! ```
//!
//! The Open → HalfOpen transition is evaluated lazily on `try_acquire`;
//! there is no background timer. Rejection is a value, not an unwinding
//! error, so callers branch on it like any other outcome.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures while Closed before the circuit opens.
    pub failure_threshold: u32,
    /// Consecutive successes while HalfOpen before the circuit closes.
    pub success_threshold: u32,
    /// How long the circuit stays open before admitting a probe.
    pub open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_duration: Duration::from_secs(60),
        }
    }
}

/// Point-in-time snapshot of the breaker's counters and state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
}

/// Fast-fail outcome: the circuit is open and the call was not attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("circuit open after {consecutive_failures} consecutive failures")]
pub struct Rejection {
    pub consecutive_failures: u32,
}

/// Error returned by [`CircuitBreaker::execute`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BreakerError<E> {
    /// The circuit was open; the operation was never invoked.
    #[error("{0}")]
    Rejected(Rejection),
    /// The operation ran and failed.
    #[error("operation failed: {0}")]
    Operation(E),
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure_at: Option<DateTime<Utc>>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_failure_at: None,
        }
    }
}

/// Guarded-execution primitive shared by every call to one upstream
/// endpoint. Counter updates and state transitions are serialized under a
/// single mutex.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState::new()),
        }
    }

    /// Ask the breaker to admit one call.
    ///
    /// While Open, the first acquire at or after `last_failure_at +
    /// open_duration` moves the circuit to HalfOpen and is admitted as a
    /// probe; earlier acquires are rejected without touching the counters.
    pub fn try_acquire(&self) -> Result<(), Rejection> {
        let mut state = self.state.lock().expect("breaker state poisoned");

        if state.state != CircuitState::Open {
            return Ok(());
        }

        let last_failure = state
            .last_failure_at
            .expect("open circuit always has a last failure");
        let open_for = Utc::now() - last_failure;

        if open_for.to_std().unwrap_or(Duration::ZERO) >= self.config.open_duration {
            tracing::info!("circuit half-open, admitting probe");
            state.state = CircuitState::HalfOpen;
            state.consecutive_successes = 0;
            Ok(())
        } else {
            Err(Rejection {
                consecutive_failures: state.consecutive_failures,
            })
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut state = self.state.lock().expect("breaker state poisoned");

        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                state.consecutive_successes += 1;
                if state.consecutive_successes >= self.config.success_threshold {
                    tracing::info!(
                        successes = state.consecutive_successes,
                        "circuit closed after successful probes"
                    );
                    *state = BreakerState::new();
                }
            }
            // A success observed while Open belongs to a call admitted
            // before the circuit tripped; it does not reopen admission.
            CircuitState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut state = self.state.lock().expect("breaker state poisoned");

        state.consecutive_successes = 0;
        state.consecutive_failures += 1;
        state.last_failure_at = Some(Utc::now());

        match state.state {
            CircuitState::Closed => {
                if state.consecutive_failures >= self.config.failure_threshold {
                    tracing::warn!(
                        failures = state.consecutive_failures,
                        "circuit opened"
                    );
                    state.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!("probe failed, circuit re-opened");
                state.state = CircuitState::Open;
            }
            CircuitState::Open => {}
        }
    }

    /// Run `operation` under breaker protection.
    ///
    /// Exactly one of three things comes back: the operation's result, the
    /// operation's own error, or a fast-fail rejection (in which case the
    /// operation was never invoked and no counter moved).
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.try_acquire().map_err(BreakerError::Rejected)?;

        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(BreakerError::Operation(err))
            }
        }
    }

    /// Unconditionally force Closed with zeroed counters. Manual operator
    /// recovery; never called on the request path.
    pub fn reset(&self) {
        let mut state = self.state.lock().expect("breaker state poisoned");
        tracing::info!("circuit breaker manually reset");
        *state = BreakerState::new();
    }

    /// Snapshot the current counters and state. No side effects.
    pub fn stats(&self) -> CircuitBreakerStats {
        let state = self.state.lock().expect("breaker state poisoned");
        CircuitBreakerStats {
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            consecutive_successes: state.consecutive_successes,
            last_failure_at: state.last_failure_at,
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
