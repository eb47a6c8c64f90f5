//! Exponential backoff with symmetric jitter.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

/// Retry bounds for one notification.
///
/// After failed attempt `i` (1-indexed) the executor waits
/// `min(initial * multiplier^(i-1), max)`, scaled by a uniform factor in
/// `[1 - jitter, 1 + jitter]`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            initial_backoff: Duration::from_millis(cfg.initial_backoff_ms),
            max_backoff: Duration::from_millis(cfg.max_backoff_ms),
            multiplier: cfg.multiplier,
            jitter: cfg.jitter.clamp(0.0, 0.99),
        }
    }
}

impl RetryPolicy {
    /// Same policy without randomization. Handy when a test needs exact
    /// timings.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// The un-jittered wait after failed attempt `attempt` (1-indexed).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let max_ms = self.max_backoff.as_millis() as f64;
        let ms = (self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent))
            .min(max_ms);
        Duration::from_millis(ms.round() as u64)
    }

    /// The wait after failed attempt `attempt`, jitter applied.
    pub fn delay<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let factor = rng.gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        base.mul_f64(factor)
    }

    /// True if another attempt is allowed after `attempt` failed.
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
