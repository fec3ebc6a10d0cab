//! Exponential reconnection backoff with jitter.

use std::time::Duration;

use rand::Rng;

/// How the connection manager paces reconnection attempts.
///
/// The delay before attempt `n` (zero-based) is
/// `min(initial_delay * multiplier^n, max_delay)`, scaled by a random factor in
/// `[1 - jitter, 1 + jitter]` and clamped back under `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry. Defaults to **1 second**.
    pub initial_delay: Duration,
    /// Upper bound on any single delay. Defaults to **30 seconds**.
    pub max_delay: Duration,
    /// Growth factor between attempts. Defaults to **2.0**; values below 1.0
    /// are treated as 1.0.
    pub multiplier: f64,
    /// Fractional jitter in `[0, 1]`. Defaults to **0.2**.
    pub jitter: f64,
    /// Attempts before giving up and moving to `Failed`. Defaults to **8**.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
            max_attempts: 8,
        }
    }
}

impl ReconnectPolicy {
    /// A policy that never waits and never jitters, handy in tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: 0.0,
            max_attempts,
        }
    }

    /// Set the attempt bound.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the jitter fraction, clamped to `[0, 1]`.
    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Un-jittered delay before zero-based attempt `attempt`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let multiplier = self.multiplier.max(1.0);
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.initial_delay.as_secs_f64() * multiplier.powi(exponent);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay)
    }

    /// Jittered delay before zero-based attempt `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter));
        Duration::try_from_secs_f64(base.as_secs_f64() * factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Attempt counter over a [`ReconnectPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay before the next attempt, or `None` once the bound is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_attempts {
            return None;
        }
        let delay = self.policy.delay(self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    /// Attempts handed out so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Start over after a successful reconnect.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn base_delay_doubles_then_caps() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.base_delay(0), Duration::from_secs(1));
        assert_eq!(policy.base_delay(1), Duration::from_secs(2));
        assert_eq!(policy.base_delay(2), Duration::from_secs(4));
        assert_eq!(policy.base_delay(5), Duration::from_secs(30));
        assert_eq!(policy.base_delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn jittered_delay_stays_within_bounds() {
        let policy = ReconnectPolicy::default();
        for attempt in 0..10 {
            let base = policy.base_delay(attempt);
            for _ in 0..50 {
                let delay = policy.delay(attempt);
                assert!(delay >= base.mul_f64(0.8) - Duration::from_millis(1));
                assert!(delay <= base.mul_f64(1.2).min(policy.max_delay));
            }
        }
    }

    #[test]
    fn backoff_is_bounded_by_max_attempts() {
        let mut backoff = Backoff::new(ReconnectPolicy::immediate(3));
        assert_eq!(backoff.next_delay(), Some(Duration::ZERO));
        assert_eq!(backoff.next_delay(), Some(Duration::ZERO));
        assert_eq!(backoff.next_delay(), Some(Duration::ZERO));
        assert_eq!(backoff.next_delay(), None);
        assert_eq!(backoff.attempts(), 3);

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert!(backoff.next_delay().is_some());
    }

    #[test]
    fn multiplier_below_one_does_not_shrink_delays() {
        let policy = ReconnectPolicy {
            multiplier: 0.5,
            ..ReconnectPolicy::default()
        };
        assert_eq!(policy.base_delay(3), Duration::from_secs(1));
    }

    #[test]
    fn huge_delays_saturate_at_max_delay() {
        let policy = ReconnectPolicy {
            initial_delay: Duration::MAX,
            max_delay: Duration::MAX,
            jitter: 0.5,
            ..ReconnectPolicy::default()
        };
        for attempt in 0..4 {
            assert!(policy.delay(attempt) <= Duration::MAX);
        }
    }
}
