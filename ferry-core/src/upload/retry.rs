//! Part retry strategies

use std::time::Duration;

use crate::error::StoreError;

/// Decides whether a failed part upload is attempted again
pub trait RetryStrategy: Send + Sync {
    /// Delay before the next attempt after attempt number `attempt` (1-based)
    /// failed with `error`, or `None` to give up
    fn next_delay(&self, attempt: u32, error: &StoreError) -> Option<Duration>;
}

/// Configuration for exponential backoff
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts per part, including the first
    pub max_attempts: u32,
    /// Delay after the first failure
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
        }
    }
}

/// Retries transient failures with doubling delays
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: RetryConfig,
}

impl ExponentialBackoff {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32, error: &StoreError) -> Option<Duration> {
        if !error.is_retryable() || attempt >= self.config.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        let delay = self
            .config
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.config.max_delay);
        Some(delay.min(self.config.max_delay))
    }
}

/// Fails the upload on the first part failure
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryStrategy for NoRetry {
    fn next_delay(&self, _attempt: u32, _error: &StoreError) -> Option<Duration> {
        None
    }
}
