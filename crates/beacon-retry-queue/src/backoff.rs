//! Exponential backoff for redelivery attempts.

use rand::Rng;
use std::time::Duration;

/// Bounded exponential backoff with multiplicative jitter.
///
/// `delay(n) = min(max, base * factor^n) * j`, with `j` uniform in `[1, 2)` when
/// jitter is enabled, and the jittered value clamped to `max`.
///
/// # Examples (defaults: base=500ms, factor=2, max=60s, no jitter)
///
/// | Attempt | Delay |
/// |---------|-------|
/// | 0       | 500ms |
/// | 1       | 1s    |
/// | 2       | 2s    |
/// | 3       | 4s    |
/// | 7+      | 60s (capped) |
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay for attempt 0.
    pub base: Duration,
    /// Growth per attempt.
    pub factor: f64,
    /// Upper bound for any delay, jitter included.
    pub max: Duration,
    /// Apply random jitter.
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            factor: 2.0,
            max: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the attempt following `attempt` previous failures.
    pub fn delay(&self, attempt: u32) -> Duration {
        let multiplier = if self.jitter {
            rand::thread_rng().gen_range(1.0..2.0)
        } else {
            1.0
        };
        self.delay_with_multiplier(attempt, multiplier)
    }

    /// Deterministic form of [`delay`](Self::delay); `multiplier` is clamped to `[1, 2]`.
    pub fn delay_with_multiplier(&self, attempt: u32, multiplier: f64) -> Duration {
        let base_ms = self.base.as_millis() as f64;
        let max_ms = self.max.as_millis() as f64;
        let exponent = attempt.min(i32::MAX as u32) as i32;

        let raw_ms = (base_ms * self.factor.max(1.0).powi(exponent)).min(max_ms);
        let jittered_ms = (raw_ms * multiplier.clamp(1.0, 2.0)).min(max_ms);

        Duration::from_millis(jittered_ms as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(500),
            factor: 2.0,
            max: Duration::from_secs(10),
            jitter: false,
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let p = policy();
        assert_eq!(p.delay(0), Duration::from_millis(500));
        assert_eq!(p.delay(1), Duration::from_secs(1));
        assert_eq!(p.delay(2), Duration::from_secs(2));
        assert_eq!(p.delay(4), Duration::from_secs(8));
        assert_eq!(p.delay(5), Duration::from_secs(10));
        assert_eq!(p.delay(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn backoff_is_monotonic_without_jitter() {
        let p = policy();
        let delays: Vec<_> = (0..20).map(|n| p.delay(n)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let p = BackoffPolicy {
            jitter: true,
            ..policy()
        };
        for attempt in 0..8 {
            let floor = p.delay_with_multiplier(attempt, 1.0);
            let d = p.delay(attempt);
            assert!(d >= floor);
            assert!(d <= p.max);
        }
    }

    #[test]
    fn multiplier_is_clamped() {
        let p = policy();
        assert_eq!(p.delay_with_multiplier(0, 0.1), Duration::from_millis(500));
        assert_eq!(p.delay_with_multiplier(0, 9.0), Duration::from_millis(1000));
    }
}
