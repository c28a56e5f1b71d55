//! Jittered exponential backoff for lock acquisition attempts.
//!
//! # Example
//!
//! ```rust
//! use meshbus_runtime::backoff::BackoffPolicy;
//! use std::time::Duration;
//!
//! let policy = BackoffPolicy::builder()
//!     .initial_delay(Duration::from_millis(100))
//!     .max_delay(Duration::from_secs(2))
//!     .multiplier(2.0)
//!     .jitter(0.0)
//!     .build();
//!
//! assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
//! assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
//! assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(2));
//! ```

use meshbus_core::config::LeaseConfig;
use rand::Rng;
use std::time::Duration;

/// Backoff configuration.
///
/// # Default Values
///
/// - `initial_delay`: 200ms
/// - `max_delay`: 2 seconds
/// - `multiplier`: 2.0
/// - `jitter`: 0.2 (each delay is shortened by up to 20%)
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Cap for the exponential growth.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Fraction of each delay that is randomized away, in `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl BackoffPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> BackoffPolicyBuilder {
        BackoffPolicyBuilder {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }

    /// Policy spacing attempts by the lease configuration's retry delays.
    #[must_use]
    pub fn from_config(config: &LeaseConfig) -> Self {
        Self::builder()
            .initial_delay(config.acquire_retry_delay)
            .max_delay(config.max_acquire_delay)
            .build()
    }

    /// Un-jittered delay after `attempt` (zero-based) failed:
    /// `initial_delay * multiplier^attempt`, capped at `max_delay`.
    #[must_use]
    pub fn base_delay(&self, attempt: usize) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Delay to sleep after `attempt` failed, with jitter applied.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || base.is_zero() {
            return base;
        }
        let cut = rand::thread_rng().gen_range(0.0..=jitter);
        base.mul_f64(1.0 - cut)
    }
}

/// Builder for [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct BackoffPolicyBuilder {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: f64,
}

impl BackoffPolicyBuilder {
    /// Set the first delay.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the cap.
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the growth factor.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Set the jitter fraction. Clamped to `0.0..=1.0` when applied.
    #[must_use]
    pub const fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Build the [`BackoffPolicy`].
    #[must_use]
    pub const fn build(self) -> BackoffPolicy {
        BackoffPolicy {
            initial_delay: self.initial_delay,
            max_delay: self.max_delay,
            multiplier: self.multiplier,
            jitter: self.jitter,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn delays_grow_then_cap() {
        let policy = BackoffPolicy::builder()
            .initial_delay(Duration::from_millis(100))
            .max_delay(Duration::from_millis(500))
            .jitter(0.0)
            .build();

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(usize::MAX), Duration::from_millis(500));
    }

    #[test]
    fn follows_lease_config() {
        let config = LeaseConfig::default();
        let policy = BackoffPolicy::from_config(&config);
        assert_eq!(policy.initial_delay, config.acquire_retry_delay);
        assert_eq!(policy.max_delay, config.max_acquire_delay);
    }

    proptest! {
        #[test]
        fn jittered_delay_never_exceeds_base(attempt in 0usize..64, jitter in 0.0f64..=1.0) {
            let policy = BackoffPolicy::builder().jitter(jitter).build();
            let base = policy.base_delay(attempt);
            let delay = policy.delay_for_attempt(attempt);
            prop_assert!(delay <= base + Duration::from_nanos(1));
            prop_assert!(delay >= base.mul_f64(1.0 - jitter) - Duration::from_nanos(1));
        }
    }
}
