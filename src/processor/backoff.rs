//! Retry policy for transient executor failures.

use std::time::Duration;

use rand::RngExt;

/// Exponential backoff with proportional jitter.
///
/// The delay before retry `attempt` (0-based) is
/// `min(base * 2^attempt, max)` plus up to `jitter` of that value.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the capped delay added at random, 0.0 to 1.0.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(60_000),
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, base: Duration) -> Self {
        self.base_delay = base;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay without jitter.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        let millis = (self.base_delay.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(millis).min(self.max_delay)
    }

    /// Delay to sleep before retry `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let capped = self.base_delay_for(attempt);
        if self.jitter <= 0.0 {
            return capped;
        }
        let spread = (capped.as_millis() as f64 * self.jitter) as u64;
        if spread == 0 {
            return capped;
        }
        capped + Duration::from_millis(rand::rng().random_range(0..=spread))
    }
}
