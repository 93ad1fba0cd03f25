//! Retry policies for stream reads and control-plane calls.

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use bqlink_core::config::DEFAULT_MAX_READ_ROWS_RETRIES;

/// How a stream reader reacts to transient failures.
///
/// `max_attempts` bounds *consecutive* failed attempts; a successful batch
/// resets the count.
#[derive(Debug, Clone)]
pub struct ReadRetryPolicy {
    pub max_attempts: u32,
    backoff: ExponentialBuilder,
}

impl Default for ReadRetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_READ_ROWS_RETRIES)
    }
}

impl ReadRetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        let max_attempts = max_attempts.max(1);
        Self {
            max_attempts,
            backoff: ExponentialBuilder::default()
                .with_min_delay(Duration::from_millis(100))
                .with_max_delay(Duration::from_secs(10))
                .with_jitter()
                .with_max_times(max_attempts as usize),
        }
    }

    /// Retries immediately. Used by tests.
    pub fn no_delay(max_attempts: u32) -> Self {
        let max_attempts = max_attempts.max(1);
        Self {
            max_attempts,
            backoff: ExponentialBuilder::default()
                .with_min_delay(Duration::ZERO)
                .with_max_delay(Duration::ZERO)
                .with_max_times(max_attempts as usize),
        }
    }

    pub fn with_backoff(mut self, backoff: ExponentialBuilder) -> Self {
        self.backoff = backoff;
        self
    }

    /// Fresh delay sequence, started again after every successful batch.
    pub fn delays(&self) -> ExponentialBackoff {
        self.backoff.clone().build()
    }
}

/// Backoff for idempotent control-plane calls.
pub fn control_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(250))
        .with_max_delay(Duration::from_secs(8))
        .with_jitter()
        .with_max_times(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_delay_yields_zero_delays() {
        let policy = ReadRetryPolicy::no_delay(3);
        let delays: Vec<Duration> = policy.delays().collect();
        assert_eq!(delays.len(), 3);
        assert!(delays.iter().all(|d| d.is_zero()));
    }

    #[test]
    fn test_default_policy() {
        let policy = ReadRetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert!(policy.delays().all(|d| d <= Duration::from_secs(20)));
    }

    #[test]
    fn test_zero_attempts_clamped() {
        assert_eq!(ReadRetryPolicy::new(0).max_attempts, 1);
    }
}
