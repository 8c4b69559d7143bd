//! Retry policy for failed fetch attempts.
//!
//! Pure exponential backoff, unit-testable away from any I/O.

use crate::config::OrchestratorSettings;
use crate::job_store::FetchFailure;

/// Exponential backoff with a hard ceiling: `base * 2^attempt_count`,
/// where `attempt_count` counts completed failed attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts allowed before permanent failure.
    pub max_attempts: i32,
    /// Backoff base in seconds.
    pub base_delay_secs: u64,
    /// Ceiling for the exponential growth, in seconds.
    pub max_delay_secs: u64,
}

impl RetryPolicy {
    pub fn new(settings: &OrchestratorSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            base_delay_secs: settings.retry_base_delay_secs,
            max_delay_secs: settings.retry_max_delay_secs,
        }
    }

    /// Backoff delay after `attempt_count` failed attempts.
    pub fn delay_secs(&self, attempt_count: i32) -> u64 {
        let shift = attempt_count.max(0).min(63) as u32;
        self.base_delay_secs
            .checked_shl(shift)
            .unwrap_or(u64::MAX)
            .min(self.max_delay_secs)
    }

    /// Absolute Unix timestamp at which the next attempt becomes eligible.
    pub fn next_retry_at(&self, attempt_count: i32) -> i64 {
        chrono::Utc::now().timestamp() + self.delay_secs(attempt_count) as i64
    }

    /// Whether a failure should consume a retry given the attempt count
    /// after the failed attempt is recorded.
    pub fn should_retry(&self, failure: &FetchFailure, attempt_count: i32) -> bool {
        !failure.is_permanent() && attempt_count < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&OrchestratorSettings::default())
    }
}
