//! Backoff and retry policies for per-key retries.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(5),
            max: Duration::from_secs(60),
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Backoff without jitter, for deterministic timing.
    pub fn fixed_exponential(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: 0.0,
        }
    }

    /// Calculate delay for the given attempt number (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = 2.0_f64.powi(attempt.min(63) as i32);
        let delay = (self.base.as_secs_f64() * exp).min(self.max.as_secs_f64());

        let jitter = self.jitter.clamp(0.0, 1.0);
        let final_delay = if jitter > 0.0 {
            let spread = delay * jitter;
            delay + rand::rng().random_range(-spread..=spread)
        } else {
            delay
        };

        Duration::try_from_secs_f64(final_delay.max(0.0))
            .unwrap_or(self.max)
            .min(self.max)
    }
}

/// Retry budget for a single key.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, the first one included, before a key is given up on.
    pub max_attempts: u32,

    /// Delay between attempts.
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: crate::DEFAULT_MAX_ATTEMPTS,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl RetryPolicy {
    /// Returns true if another attempt is allowed after `failures` consecutive failures.
    pub fn should_retry(&self, failures: u32) -> bool {
        failures < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_policy() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            jitter: 0.25,
        };

        let d0 = policy.delay(0);
        let d1 = policy.delay(1);
        let d2 = policy.delay(2);

        assert!(d0 <= Duration::from_millis(125));
        assert!(d1 >= Duration::from_millis(150) && d1 <= Duration::from_millis(250));
        assert!(d2 >= Duration::from_millis(300) && d2 <= Duration::from_millis(500));
    }

    #[test]
    fn test_backoff_max() {
        let policy = BackoffPolicy::fixed_exponential(Duration::from_secs(1), Duration::from_secs(5));

        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
        assert_eq!(policy.delay(10), Duration::from_secs(5));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_unbounded_max() {
        let policy = BackoffPolicy::fixed_exponential(Duration::from_secs(1), Duration::MAX);
        assert_eq!(policy.delay(3), Duration::from_secs(8));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(1 << 63));

        let saturated = BackoffPolicy::fixed_exponential(Duration::from_secs(1 << 40), Duration::MAX);
        assert_eq!(saturated.delay(u32::MAX), Duration::MAX);

        let jittered = BackoffPolicy {
            jitter: 0.5,
            ..saturated
        };
        assert!(jittered.delay(u32::MAX) >= Duration::from_secs(1 << 40));
    }

    #[test]
    fn test_retry_policy_budget() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);

        assert!(policy.should_retry(1));
        assert!(policy.should_retry(4));
        assert!(!policy.should_retry(5));
    }
}
