//! # Retry Policy
//!
//! Decides what happens to a task whose handler failed: requeue after an exponential
//! delay, or fail it permanently.

use std::time::Duration;

/// Outcome of a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to `queued`, message hidden for `delay`
    Retry { delay: Duration },
    /// Task, step and run fail
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(300))
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// `base * 2^attempts_count`, capped at the maximum delay
    pub fn delay_for(&self, attempts_count: u32) -> Duration {
        let factor = 2u32.checked_pow(attempts_count).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// `attempts_count` already includes the attempt that just failed.
    pub fn decide(&self, attempts_count: u32, max_attempts: u32, permanent: bool) -> RetryDecision {
        if permanent || attempts_count >= max_attempts {
            RetryDecision::Fail
        } else {
            RetryDecision::Retry {
                delay: self.delay_for(attempts_count),
            }
        }
    }
}
