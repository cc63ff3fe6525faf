//! Capped exponential backoff between retry attempts.

use std::time::Duration;

/// Retry configuration for one logical upstream request.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubles each retry after that.
    pub base_delay: Duration,
    /// Backoff never exceeds this.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

/// Tracks how many retries a request has spent and yields the delay to
/// sleep before each one.
pub struct RetryPolicy {
    config: RetryConfig,
    retries_taken: u32,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            retries_taken: 0,
        }
    }

    /// Delay before the next retry, or `None` once retries are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.retries_taken >= self.config.max_retries {
            return None;
        }

        // base * 2^(retry - 1), capped.
        let delay = self
            .config
            .base_delay
            .saturating_mul(1_u32 << self.retries_taken.min(31))
            .min(self.config.max_delay);

        self.retries_taken += 1;
        Some(delay)
    }

    pub fn retries_taken(&self) -> u32 {
        self.retries_taken
    }
}
