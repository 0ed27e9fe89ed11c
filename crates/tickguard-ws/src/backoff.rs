//! Reconnect backoff policy.
//!
//! `delay = min(initial * 2^(attempt - 1) + jitter, max)` where jitter is a
//! uniform fraction (default 0-30%) of the exponential term. The first retry
//! after a failure therefore waits roughly `initial`.

use crate::error::{WsError, WsResult};
use rand::Rng;
use std::time::Duration;

/// Default jitter upper bound as a fraction of the exponential term.
pub const DEFAULT_JITTER_FRACTION: f64 = 0.3;

/// Exponent cap; `2^20 * initial` already exceeds any sane `max`.
const MAX_EXPONENT: u32 = 20;

/// Exponential backoff with proportional jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    /// Jitter upper bound as a fraction of the exponential term, in `[0, 1]`.
    pub jitter_fraction: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(1_000),
            max: Duration::from_millis(60_000),
            jitter_fraction: DEFAULT_JITTER_FRACTION,
        }
    }
}

impl BackoffPolicy {
    /// Create a policy, rejecting bounds that would break monotonicity.
    pub fn new(initial: Duration, max: Duration, jitter_fraction: f64) -> WsResult<Self> {
        if initial.is_zero() {
            return Err(WsError::InvalidConfig("initial backoff must be > 0".to_string()));
        }
        if initial > max {
            return Err(WsError::InvalidConfig(format!(
                "initial backoff {}ms exceeds max {}ms",
                initial.as_millis(),
                max.as_millis()
            )));
        }
        // Above 1.0 the jittered delay for attempt n could exceed attempt n+1.
        if !(0.0..=1.0).contains(&jitter_fraction) {
            return Err(WsError::InvalidConfig(format!(
                "jitter fraction {jitter_fraction} outside [0, 1]"
            )));
        }
        Ok(Self {
            initial,
            max,
            jitter_fraction,
        })
    }

    /// Exponential term for `attempt` (1-based), before jitter and capping.
    fn exponential_ms(&self, attempt: u32) -> u128 {
        let exponent = attempt.saturating_sub(1).min(MAX_EXPONENT);
        self.initial.as_millis().saturating_mul(1u128 << exponent)
    }

    /// Delay for `attempt` with a given jitter sample in `[0, 1]`.
    pub fn delay_with_sample(&self, attempt: u32, sample: f64) -> Duration {
        let exp_ms = self.exponential_ms(attempt);
        let sample = sample.clamp(0.0, 1.0);
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let jitter_ms = (exp_ms as f64 * self.jitter_fraction * sample) as u128;
        let total = exp_ms.saturating_add(jitter_ms).min(self.max.as_millis());
        Duration::from_millis(u64::try_from(total).unwrap_or(u64::MAX))
    }

    /// Delay for `attempt` with a fresh random jitter sample.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let sample: f64 = rand::rng().random_range(0.0..=1.0);
        self.delay_with_sample(attempt, sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_millis(500), Duration::from_secs(30), 0.3).unwrap()
    }

    #[test]
    fn test_first_attempt_uses_initial() {
        assert_eq!(policy().delay_with_sample(1, 0.0), Duration::from_millis(500));
        assert_eq!(policy().delay_with_sample(1, 1.0), Duration::from_millis(650));
    }

    #[test]
    fn test_exponential_growth_without_jitter() {
        let p = policy();
        assert_eq!(p.delay_with_sample(2, 0.0), Duration::from_millis(1_000));
        assert_eq!(p.delay_with_sample(3, 0.0), Duration::from_millis(2_000));
        assert_eq!(p.delay_with_sample(4, 0.0), Duration::from_millis(4_000));
    }

    #[test]
    fn test_capped_at_max() {
        let p = policy();
        assert_eq!(p.delay_with_sample(10, 1.0), Duration::from_secs(30));
        assert_eq!(p.delay_with_sample(u32::MAX, 0.5), Duration::from_secs(30));
    }

    #[test]
    fn test_non_decreasing_even_with_worst_case_jitter() {
        // Highest jitter on attempt n against lowest jitter on attempt n+1.
        let p = policy();
        for attempt in 1..40 {
            let hi = p.delay_with_sample(attempt, 1.0);
            let lo_next = p.delay_with_sample(attempt + 1, 0.0);
            assert!(lo_next >= hi, "attempt {attempt}: {lo_next:?} < {hi:?}");
            assert!(hi <= p.max);
        }
    }

    #[test]
    fn test_random_delay_within_bounds() {
        let p = policy();
        for _ in 0..200 {
            let d = p.next_delay(3);
            assert!(d >= Duration::from_millis(2_000));
            assert!(d <= Duration::from_millis(2_600));
        }
    }

    #[test]
    fn test_invalid_policies_rejected() {
        assert!(BackoffPolicy::new(Duration::ZERO, Duration::from_secs(1), 0.3).is_err());
        assert!(BackoffPolicy::new(Duration::from_secs(2), Duration::from_secs(1), 0.3).is_err());
        assert!(BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(2), 1.5).is_err());
    }
}
