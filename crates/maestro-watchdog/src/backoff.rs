use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Capped exponential backoff between restart attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub base_ms: u64,
    /// Growth per further consecutive failure.
    pub factor: f64,
    /// Upper bound on any delay.
    pub max_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            factor: 2.0,
            max_ms: 60_000,
        }
    }
}

impl BackoffPolicy {
    /// Delay in milliseconds after `consecutive_failures` failures:
    /// `min(base * factor^(failures - 1), max)`. Zero failures means no wait.
    pub fn delay_ms(&self, consecutive_failures: u32) -> u64 {
        if consecutive_failures == 0 {
            return 0;
        }
        let exp = consecutive_failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.base_ms as f64 * self.factor.max(1.0).powi(exp);
        if !raw.is_finite() || raw >= self.max_ms as f64 {
            self.max_ms
        } else {
            raw as u64
        }
    }

    /// [`Self::delay_ms`] as a `Duration`.
    pub fn delay(&self, consecutive_failures: u32) -> Duration {
        Duration::from_millis(self.delay_ms(consecutive_failures))
    }
}
