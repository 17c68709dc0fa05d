//! Retry policy: decides backoff delays.

use std::time::Duration;

/// Upper bound for a single retry delay.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Queue-wide retry backoff.
///
/// The base delay is per task (`retry_delay`); the policy only scales it.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Backoff multiplier. 1.0 keeps the delay fixed; values below 1.0 are treated as 1.0.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { multiplier: 1.0 }
    }
}

impl RetryPolicy {
    pub fn new(multiplier: f64) -> Self {
        Self { multiplier }
    }

    /// Delay before retry number `attempt` (1-indexed).
    ///
    /// delay = base * multiplier^(attempt - 1), capped at one day.
    ///
    /// Example with base=2s, multiplier=2.0:
    /// - attempt 1: 2s
    /// - attempt 2: 4s
    /// - attempt 3: 8s
    pub fn next_delay(&self, base: Duration, attempt: u32) -> Duration {
        let multiplier = if self.multiplier.is_finite() {
            self.multiplier.max(1.0)
        } else {
            1.0
        };
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = base.as_secs_f64() * multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(MAX_RETRY_DELAY)
            .min(MAX_RETRY_DELAY)
    }
}
