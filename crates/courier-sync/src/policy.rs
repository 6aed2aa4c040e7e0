//! Retry and backoff policy for outbound deliveries.

use std::time::Duration;

use rand::Rng;

use courier_shared::constants::{
    DEFAULT_BACKOFF_BASE_MS, DEFAULT_BACKOFF_JITTER, DEFAULT_BACKOFF_MAX_MS,
    DEFAULT_MANUAL_RETRY_CAP, DEFAULT_MAX_ATTEMPTS,
};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Automatic attempts before a message is marked failed.
    pub max_attempts: u32,
    /// Lifetime attempt cap; manual retries stop here.
    pub manual_retry_cap: u32,
    /// Delay after the first failure. Doubles with every further failure.
    pub backoff_base: Duration,
    /// Upper bound for a single delay, before jitter.
    pub backoff_max: Duration,
    /// Relative jitter in `[0, 1)`: each delay is scaled by a random factor
    /// in `[1 - jitter, 1 + jitter]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            manual_retry_cap: DEFAULT_MANUAL_RETRY_CAP,
            backoff_base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
            backoff_max: Duration::from_millis(DEFAULT_BACKOFF_MAX_MS),
            jitter: DEFAULT_BACKOFF_JITTER,
        }
    }
}

impl RetryPolicy {
    /// Backoff before the next attempt, given how many attempts have failed
    /// so far. Zero failures means no wait.
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        let nominal = self.nominal_delay(failed_attempts);
        if nominal.is_zero() || self.jitter <= 0.0 {
            return nominal;
        }

        let jitter = self.jitter.min(0.99);
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        nominal.mul_f64(factor)
    }

    /// Exponential delay without jitter: `base * 2^(n-1)`, capped.
    pub fn nominal_delay(&self, failed_attempts: u32) -> Duration {
        if failed_attempts == 0 {
            return Duration::ZERO;
        }

        let shift = failed_attempts - 1;
        let multiplier = 1u32.checked_shl(shift).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(multiplier)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }

    /// Attempt ceiling granted by a manual retry of a message that has
    /// failed `retry_count` times, or `None` once the lifetime cap is spent.
    pub fn manual_retry_ceiling(&self, retry_count: u32) -> Option<u32> {
        if retry_count >= self.manual_retry_cap {
            return None;
        }
        Some(
            retry_count
                .saturating_add(self.max_attempts)
                .min(self.manual_retry_cap),
        )
    }
}
