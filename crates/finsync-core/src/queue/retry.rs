//! Retry policy: decides backoff delays.

use std::time::Duration;

use crate::config::RetryConfig;

/// Exponential backoff with bounded jitter.
///
/// delay(n) = min(cap, base * factor^(n-1)), scaled by a random factor in
/// `[1 - jitter, 1 + jitter)` and clamped to the cap again. Once the
/// exponential part reaches the cap the jitter is dropped, so capped delays
/// are exactly `max_delay`.
///
/// Example with base=1s, factor=2.0, no jitter:
/// - attempt 1 (first failure): 1s
/// - attempt 2: 2s
/// - attempt 3: 4s
/// - attempt 10: 300s (capped)
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Base delay for the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub factor: f64,

    /// Upper bound for any single delay.
    pub max_delay: Duration,

    /// Relative jitter in `[0, 1)`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            factor: 2.0,
            max_delay: Duration::from_secs(300),
            jitter: 0.2,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_ms),
            factor: config.factor,
            max_delay: Duration::from_secs(config.max_delay_seconds),
            jitter: config.jitter,
        }
    }
}

impl RetryPolicy {
    /// Policy without randomness, for tests and dry runs.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-indexed).
    pub fn next_delay(&self, attempt: u32) -> Duration {
        self.delay_for(attempt, rand::random::<f64>())
    }

    /// Deterministic core of [`RetryPolicy::next_delay`]; `unit` is a sample
    /// from `[0, 1)`.
    pub fn delay_for(&self, attempt: u32, unit: f64) -> Duration {
        let cap = self.max_delay.as_secs_f64();
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let anchor = (self.base_delay.as_secs_f64() * self.factor.powi(exponent)).min(cap);
        if anchor >= cap {
            return self.max_delay;
        }

        let unit = unit.clamp(0.0, 1.0);
        let scaled = anchor * (1.0 + self.jitter * (2.0 * unit - 1.0));
        // cap as f64 can round past Duration::MAX
        Duration::try_from_secs_f64(scaled.clamp(0.0, cap)).unwrap_or(self.max_delay)
    }
}
