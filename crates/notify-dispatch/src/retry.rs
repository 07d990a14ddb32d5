//! Retry backoff policy for delivery attempts.
//!
//! Exponential backoff with a hard cap and full-range jitter.

use std::time::Duration;

use rand::RngExt;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of send attempts, including the first one.
    pub max_attempts: u32,
    /// Base delay. Uncapped delay = base * 2^attempt.
    pub base_delay: Duration,
    /// Hard cap on the computed delay.
    pub max_delay: Duration,
    /// When true, the delay is drawn uniformly from [0, capped].
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30000),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Capped exponential delay for a 0-indexed attempt, before jitter.
    pub fn capped_delay(&self, attempt: u32) -> Duration {
        // 2^attempt saturates instead of overflowing for large attempt numbers.
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay to wait after the failed 0-indexed `attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let capped = self.capped_delay(attempt);
        if !self.jitter {
            return capped;
        }

        let capped_ms = u64::try_from(capped.as_millis()).unwrap_or(u64::MAX);
        if capped_ms == 0 {
            return capped;
        }
        Duration::from_millis(rand::rng().random_range(0..=capped_ms))
    }

    /// Delay after `attempt`, stretched to honor a provider's retry-after hint.
    ///
    /// The hint never pushes the delay beyond `max_delay`.
    pub fn delay_with_hint(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        match retry_after {
            Some(hint) => delay.max(hint).min(self.max_delay),
            None => delay,
        }
    }

    /// Whether another attempt may follow the 0-indexed `attempt`.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt.saturating_add(1) < self.max_attempts
    }
}
