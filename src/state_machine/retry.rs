//! Backoff timing for retried attempts.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with jitter, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt.
    pub base_delay: Duration,
    /// Upper bound for any single delay, hints included.
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the delay randomized in both directions (0.1 = ±10%).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// No waiting at all; used by tests that exercise retry counts.
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before re-admitting a task whose `attempt`-th attempt (1-based) failed.
    ///
    /// `base * multiplier^(attempt - 1)`, capped, jittered, and never below a
    /// server-provided `retry-after` hint (the hint is capped as well).
    pub fn delay_for_attempt(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let max = self.max_delay.as_secs_f64();
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = (self.base_delay.as_secs_f64() * self.multiplier.powi(exponent)).min(max);

        let jittered = if self.jitter > 0.0 && base > 0.0 {
            let range = base * self.jitter;
            (base + rand::thread_rng().gen_range(-range..=range)).clamp(0.0, max)
        } else {
            base
        };

        let floor = hint.map(|h| h.as_secs_f64().min(max)).unwrap_or(0.0);
        Duration::from_secs_f64(jittered.max(floor))
    }
}
