//! Retry policy arithmetic shared by the chunking executor.

use std::time::Duration;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::TaskStatus;

/// When and how often a failed execution is retried.
///
/// An execution runs at most `max_retries + 1` times. Before retry `n`
/// (1-indexed) the caller waits `retry_delay_ms * backoff_multiplier^(n-1)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Result statuses that trigger a retry.
    pub retry_on: Vec<TaskStatus>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            retry_on: vec![TaskStatus::Error],
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<()> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(anyhow!("retry.backoff_multiplier must be a finite value >= 1.0"));
        }
        if self.retry_on.contains(&TaskStatus::Complete) {
            return Err(anyhow!("retry.retry_on must not contain COMPLETE"));
        }
        Ok(())
    }

    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn should_retry(&self, status: TaskStatus) -> bool {
        self.retry_on.contains(&status)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (1-indexed).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1);
        let factor = self.backoff_multiplier.powi(exponent.min(i32::MAX as u32) as i32);
        let millis = self.retry_delay_ms as f64 * factor;
        if !millis.is_finite() || millis >= u64::MAX as f64 {
            return Duration::from_millis(u64::MAX);
        }
        Duration::from_millis(millis.round() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_geometrically() {
        let policy = RetryPolicy {
            max_retries: 3,
            retry_delay_ms: 100,
            backoff_multiplier: 2.0,
            retry_on: vec![TaskStatus::Error],
        };
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(400));
        assert_eq!(policy.max_attempts(), 4);
    }

    #[test]
    fn fractional_multiplier_rounds() {
        let policy = RetryPolicy {
            retry_delay_ms: 100,
            backoff_multiplier: 1.5,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(225));
    }

    #[test]
    fn validate_rejects_shrinking_backoff_and_complete() {
        let shrinking = RetryPolicy {
            backoff_multiplier: 0.5,
            ..RetryPolicy::default()
        };
        assert!(shrinking.validate().is_err());

        let retry_complete = RetryPolicy {
            retry_on: vec![TaskStatus::Complete],
            ..RetryPolicy::default()
        };
        assert!(retry_complete.validate().is_err());
        assert!(RetryPolicy::default().validate().is_ok());
    }
}
