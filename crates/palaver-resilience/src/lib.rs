//! Resilience primitives for calling an unreliable upstream.
//!
//! This crate provides:
//! - Circuit breaker: guarded execution with fast-fail while open
//! - Retry policy: capped exponential backoff between attempts

pub mod breaker;
pub mod retry;

pub use breaker::{
    BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState,
    Rejection,
};
pub use retry::{RetryConfig, RetryPolicy};
