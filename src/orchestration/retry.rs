//! Bounded retry with exponential backoff for execution-time failures.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay before retry `attempt` (1-based): `base * 2^(attempt - 1)`.
///
/// Saturates instead of overflowing for large attempt numbers.
pub fn backoff_delay(attempt: u32, base: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << exponent)
}

/// Retry bound and backoff parameters, the `[retry]` config section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per batch, including the first dispatch. The default
    /// of 3 allows two automatic retries.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// Policy without delays, for tests and dry runs.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Whether another attempt is allowed after `attempts` have failed.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Capped backoff before the retry that follows `attempts` failures.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        backoff_delay(attempts, self.base_delay()).min(Duration::from_millis(self.max_delay_ms))
    }
}
