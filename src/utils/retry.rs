//! Retry utilities: reconnect delay policy and driver connection backoff.
//!
//! `ReconnectPolicy` is the listener's pure delay function; the listener owns
//! the attempt counter. `connection_backoff` uses `backon` for the one-off
//! connection retries at startup.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Exponents beyond this already exceed any representable delay.
const MAX_EXPONENT: u32 = 64;

/// Exponential reconnect delay clamped at a maximum.
///
/// `delay(attempt) = min(base * 2^attempt, max)` where `attempt` is the
/// 0-based failure count since the last successful read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    base: Duration,
    max: Duration,
}

impl ReconnectPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay before reconnect attempt number `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2f64.powi(attempt.min(MAX_EXPONENT) as i32);
        let secs = self.base.as_secs_f64() * factor;
        if secs >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

/// Backoff for the initial store connection at startup.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 30
/// - Jitter enabled
pub fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30)
        .with_jitter()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base_secs: f64, max_secs: f64) -> ReconnectPolicy {
        ReconnectPolicy::new(
            Duration::from_secs_f64(base_secs),
            Duration::from_secs_f64(max_secs),
        )
    }

    #[test]
    fn test_first_attempt_is_base_delay() {
        let p = policy(1.0, 60.0);
        assert_eq!(p.delay(0), Duration::from_secs(1));
    }

    #[test]
    fn test_doubles_per_attempt() {
        let p = policy(1.0, 60.0);
        assert_eq!(p.delay(1), Duration::from_secs(2));
        assert_eq!(p.delay(2), Duration::from_secs(4));
        assert_eq!(p.delay(5), Duration::from_secs(32));
    }

    #[test]
    fn test_clamped_at_max() {
        let p = policy(1.0, 60.0);
        assert_eq!(p.delay(6), Duration::from_secs(60));
        assert_eq!(p.delay(10), Duration::from_secs(60));
        assert_eq!(p.delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_matches_closed_form() {
        let p = policy(0.25, 30.0);
        for n in 0..20u32 {
            let expected = (0.25 * 2f64.powi(n as i32)).min(30.0);
            assert!((p.delay(n).as_secs_f64() - expected).abs() < 1e-9, "attempt {}", n);
        }
    }

    #[test]
    fn test_non_decreasing() {
        let p = policy(0.1, 45.0);
        let mut previous = Duration::ZERO;
        for n in 0..100u32 {
            let d = p.delay(n);
            assert!(d >= previous);
            previous = d;
        }
    }

    #[test]
    fn test_zero_base_stays_zero() {
        let p = policy(0.0, 60.0);
        assert_eq!(p.delay(0), Duration::ZERO);
        assert_eq!(p.delay(40), Duration::ZERO);
    }
}
