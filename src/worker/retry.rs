//! Retry policy — eligibility and capped exponential backoff.

use std::time::Duration;

use crate::config::RetryConfig;
use crate::tasks::Task;

/// Pure retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            base: config.base,
            max_backoff: config.max_backoff,
        }
    }

    /// Failed and still under its retry bound.
    pub fn eligible(&self, task: &Task) -> bool {
        task.retry_eligible()
    }

    /// `min(base * 2^retry_count, max_backoff)`.
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}
