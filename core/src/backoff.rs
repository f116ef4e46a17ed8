/// Reconnect delay policy
use rand::Rng;
use std::time::Duration;

/// Fraction of the computed delay used as the jitter band
const JITTER_RATIO: f64 = 0.2;

/// Exponential backoff: `min(base * 2^attempt, cap)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1000),
            cap: Duration::from_millis(30_000),
            jitter: false,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Deterministic delay for the given attempt number
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis().min(u64::MAX as u128) as u64;
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let raw = Duration::from_millis(base_ms.saturating_mul(factor));
        raw.min(self.cap)
    }

    /// Delay actually slept by the socket driver; spreads retries by up to
    /// +/-20% when jitter is enabled.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let factor = rand::thread_rng().gen_range((1.0 - JITTER_RATIO)..=(1.0 + JITTER_RATIO));
        delay.mul_f64(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_until_cap() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(1000));
        assert_eq!(policy.delay(1), Duration::from_millis(2000));
        assert_eq!(policy.delay(4), Duration::from_millis(16_000));
        assert_eq!(policy.delay(5), Duration::from_millis(30_000));
        assert_eq!(policy.delay(63), Duration::from_millis(30_000));
        assert_eq!(policy.delay(200), Duration::from_millis(30_000));
    }

    #[test]
    fn test_monotonic_non_decreasing() {
        let policy = BackoffPolicy::new(Duration::from_millis(250), Duration::from_secs(10));
        let mut prev = Duration::ZERO;
        for attempt in 0..100 {
            let d = policy.delay(attempt);
            assert!(d >= prev, "attempt {} went backwards", attempt);
            assert!(d <= policy.cap);
            prev = d;
        }
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = BackoffPolicy::default().with_jitter(true);
        for attempt in 0..8 {
            let exact = policy.delay(attempt);
            let jittered = policy.next_delay(attempt);
            assert!(jittered >= exact.mul_f64(0.8) - Duration::from_millis(1));
            assert!(jittered <= exact.mul_f64(1.2) + Duration::from_millis(1));
        }
    }
}
