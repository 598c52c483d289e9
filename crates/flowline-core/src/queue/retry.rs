//! Retry budget and backoff computation for queued jobs.

use std::time::Duration;

use flowline_types::job::JobOptions;
use flowline_types::workflow::{Backoff, BackoffKind};

/// Largest exponent applied to an exponential backoff.
const MAX_BACKOFF_EXPONENT: u32 = 20;

// ---------------------------------------------------------------------------
// RetryHandler
// ---------------------------------------------------------------------------

/// Stateless retry decisions for failed jobs.
pub struct RetryHandler;

impl RetryHandler {
    /// Whether a job that has now failed `failed_attempts` times may run again.
    pub fn should_retry(options: &JobOptions, failed_attempts: u32) -> bool {
        failed_attempts < options.max_attempts
    }

    /// Delay before the next attempt after `failed_attempts` failures.
    ///
    /// Fixed backoff always waits `delay_ms`; exponential doubles it per
    /// failure: `delay_ms * 2^(failed_attempts - 1)`.
    pub fn delay(backoff: &Backoff, failed_attempts: u32) -> Duration {
        let ms = match backoff.kind {
            BackoffKind::Fixed => backoff.delay_ms,
            BackoffKind::Exponential => {
                let exponent = failed_attempts.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
                backoff.delay_ms.saturating_mul(1u64 << exponent)
            }
        };
        Duration::from_millis(ms)
    }
}
