//! Exponential backoff for transient action failures.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry policy for transient failures.
///
/// Delay before retry `n` (1-indexed) is `base * multiplier^(n-1)`, capped
/// at `max_delay`, then scaled by a random factor in `[1 - jitter, 1 + jitter]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    #[serde(with = "crate::config::duration_ms")]
    pub base_delay: Duration,
    /// Upper bound on the un-jittered delay.
    #[serde(with = "crate::config::duration_ms")]
    pub max_delay: Duration,
    /// Growth factor between retries.
    pub multiplier: f64,
    /// Relative jitter, `0.2` means ±20%.
    pub jitter: f64,
    /// Maximum attempts per action, including the first. `None` is unlimited.
    pub max_attempts: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.2,
            max_attempts: None,
        }
    }
}

impl BackoffPolicy {
    /// Set the maximum attempts per action.
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Set the base delay.
    #[must_use]
    pub const fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the delay cap.
    #[must_use]
    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the relative jitter.
    #[must_use]
    pub const fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Whether another attempt is allowed after `attempts_made` attempts.
    pub fn allows_attempt(&self, attempts_made: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempts_made < max)
    }

    /// Un-jittered delay before retry `retry` (1-indexed). Zero for retry 0.
    pub fn nominal_delay(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let base_ms = self.base_delay.as_secs_f64() * 1000.0;
        let delay_ms = base_ms * self.multiplier.powi(exponent);
        let cap_ms = self.max_delay.as_secs_f64() * 1000.0;

        Duration::from_secs_f64(delay_ms.min(cap_ms).max(0.0) / 1000.0)
    }

    /// Jittered delay before retry `retry` (1-indexed).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let nominal = self.nominal_delay(retry);
        if self.jitter <= 0.0 || nominal.is_zero() {
            return nominal;
        }

        let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        nominal.mul_f64(factor.max(0.0))
    }

    /// Lower bound of [`Self::delay_for`] for `retry`.
    pub fn min_delay(&self, retry: u32) -> Duration {
        self.nominal_delay(retry)
            .mul_f64((1.0 - self.jitter.max(0.0)).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn without_jitter() -> BackoffPolicy {
        BackoffPolicy::default().with_jitter(0.0)
    }

    #[test]
    fn test_calculate_delay_exponential() {
        let policy = without_jitter();
        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
    }

    #[test]
    fn test_calculate_delay_capped() {
        let policy = without_jitter();
        // 1s * 2^9 = 512s, capped at 60s
        assert_eq!(policy.delay_for(10), Duration::from_secs(60));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let policy = BackoffPolicy::default();
        for _ in 0..200 {
            let delay = policy.delay_for(3);
            assert!(delay >= Duration::from_millis(3199), "{delay:?}");
            assert!(delay <= Duration::from_millis(4801), "{delay:?}");
        }
    }

    #[test]
    fn unlimited_attempts_by_default() {
        let policy = BackoffPolicy::default();
        assert!(policy.allows_attempt(u32::MAX - 1));

        let bounded = policy.with_max_attempts(3);
        assert!(bounded.allows_attempt(2));
        assert!(!bounded.allows_attempt(3));
    }

    #[test]
    fn min_delay_accounts_for_jitter() {
        let policy = BackoffPolicy::default();
        let min = policy.min_delay(1);
        assert!(min > Duration::from_millis(799) && min <= Duration::from_millis(800));
    }
}
