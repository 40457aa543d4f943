//! Exponential backoff with jitter.

use std::time::Duration;

/// Exponential backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay before jitter.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0). Jitter only ever lengthens a delay.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Calculate delay for the given attempt number.
    ///
    /// The result lies in `[d, d * (1 + jitter)]` where
    /// `d = min(base * 2^attempt, max)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay = self.base.as_secs_f64() * 2.0_f64.powi(exponent);
        let delay = delay.min(self.max.as_secs_f64());

        let jitter = self.jitter.clamp(0.0, 1.0);
        let final_delay = delay + delay * jitter * rand::random::<f64>();

        Duration::from_secs_f64(final_delay)
    }

    /// Upper bound on any delay this policy can produce.
    pub fn ceiling(&self) -> Duration {
        self.max.mul_f64(1.0 + self.jitter.clamp(0.0, 1.0))
    }
}

/// Stateful backoff: steps through a policy and can be reset after a
/// sustained success.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    /// Create a backoff positioned at the first attempt.
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Return the delay for the current attempt and advance.
    pub fn step(&mut self) -> Duration {
        let delay = self.policy.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Go back to the initial delay.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of steps taken since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_backoff_policy() {
        let policy = BackoffPolicy::default();

        let d0 = policy.delay(0);
        let d1 = policy.delay(1);
        let d2 = policy.delay(2);

        // Should increase exponentially (with some jitter variance)
        assert!(d0 < Duration::from_millis(200));
        assert!(d1 < Duration::from_millis(400));
        assert!(d2 < Duration::from_millis(800));
    }

    #[test]
    fn test_backoff_max() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(1),
            max: Duration::from_secs(5),
            jitter: 0.0,
        };

        assert_eq!(policy.delay(10), Duration::from_secs(5));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_step_and_reset() {
        let mut backoff = Backoff::new(BackoffPolicy {
            base: Duration::from_millis(50),
            max: Duration::from_secs(15),
            jitter: 0.0,
        });

        assert_eq!(backoff.step(), Duration::from_millis(50));
        assert_eq!(backoff.step(), Duration::from_millis(100));
        assert_eq!(backoff.step(), Duration::from_millis(200));
        assert_eq!(backoff.attempt(), 3);

        backoff.reset();
        assert_eq!(backoff.step(), Duration::from_millis(50));
    }

    proptest! {
        #[test]
        fn test_delay_bounded(attempt in 0u32..64, jitter in 0.0f64..1.0) {
            let policy = BackoffPolicy {
                base: Duration::from_millis(50),
                max: Duration::from_secs(15),
                jitter,
            };

            let delay = policy.delay(attempt);
            let floor = (policy.base.as_secs_f64() * 2.0_f64.powi(attempt as i32))
                .min(policy.max.as_secs_f64());

            prop_assert!(delay.as_secs_f64() >= floor - 1e-9);
            prop_assert!(delay <= policy.ceiling() + Duration::from_micros(1));
        }
    }
}
