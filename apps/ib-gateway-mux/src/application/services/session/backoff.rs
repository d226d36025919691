//! Reconnect Backoff
//!
//! Exponential backoff with jitter between re-login attempts. The attempt
//! counter lives on the session, so the policy itself is stateless: it maps
//! "failures so far" to "how long to wait before the next try".

use std::time::Duration;

use rand::Rng;

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
    /// Growth factor per failed attempt.
    pub multiplier: f64,
    /// Jitter as a fraction of the delay (0.1 = ±10%).
    pub jitter_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Same policy without jitter.
    #[must_use]
    pub const fn without_jitter(self) -> Self {
        Self {
            jitter_factor: 0.0,
            ..self
        }
    }

    /// Delay before the next attempt, given `failures` so far.
    ///
    /// The first attempt after losing the session goes out immediately.
    #[must_use]
    pub fn delay_for_attempt(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        self.apply_jitter(self.base_delay(failures))
    }

    /// Un-jittered delay for `failures` (at least 1).
    #[must_use]
    pub fn base_delay(&self, failures: u32) -> Duration {
        let exponent = i32::try_from(failures.saturating_sub(1)).unwrap_or(i32::MAX);
        #[allow(clippy::cast_precision_loss)]
        let scaled =
            (self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent)).round();
        let max_millis = self.max_delay.as_millis();

        let millis = if scaled.is_finite() && scaled > 0.0 {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            {
                (scaled as u128).min(max_millis)
            }
        } else if scaled.is_infinite() {
            max_millis
        } else {
            0
        };
        Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.jitter_factor <= 0.0 {
            return duration;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * self.jitter_factor;
        let jitter: f64 = rand::rng().random_range(-jitter_range..=jitter_range);
        let adjusted_millis = (base_millis + jitter).max(1.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let adjusted_u64 = adjusted_millis as u64;
        Duration::from_millis(adjusted_u64)
    }
}
