//! Retry and backoff policy for reconnecting consumers.
//!
//! Continuous feed consumers reconnect after interruptions with bounded
//! exponential backoff. [`RetryConfig`] holds the schedule; the consumers
//! drive it with [`delay_for_attempt`](RetryConfig::delay_for_attempt).

use std::time::Duration;

/// Configuration for reconnect backoff behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of reconnect attempts.
    /// Set to `usize::MAX` for infinite retries (continuous consumers).
    pub max_attempts: usize,

    /// Initial delay before first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Infinite retry for long-lived continuous consumers.
    ///
    /// Retries forever with exponential backoff capped at 30 seconds, so a
    /// listener survives store restarts and extended outages without
    /// manual intervention. Cancellation via `stop()` is the only exit.
    ///
    /// # Backoff Schedule
    ///
    /// ```text
    /// Attempt  Delay
    /// -------  -----
    /// 1        100ms
    /// 2        200ms
    /// 3        400ms
    /// ...
    /// 9+       30s (cap, retry forever)
    /// ```
    pub fn continuous() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
        }
    }

    /// No retries at all: the first interruption is terminal.
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let multiplier = self.backoff_factor.powi((attempt - 1).min(i32::MAX as usize) as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        if !delay_secs.is_finite() {
            return self.max_delay;
        }
        let delay = Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()));

        std::cmp::min(delay, self.max_delay)
    }

    /// Check whether another attempt is allowed after `attempt` failures.
    pub fn allows_attempt(&self, attempt: usize) -> bool {
        attempt <= self.max_attempts
    }
}
