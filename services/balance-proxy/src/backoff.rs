//! Exponential backoff between dispatch attempts
//!
//! Used after upstream 5xx responses and transport failures, which are not
//! the selected key's fault and so do not rotate it out.

use std::time::Duration;

use rand::RngExt;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Fraction of the delay added or removed at random, in `[0, 1]`.
    pub jitter: f64,
}

impl Backoff {
    /// Delay without jitter: `initial * multiplier^attempt`, capped at `max`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if self.initial.is_zero() {
            return Duration::ZERO;
        }
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let millis = self.initial.as_millis() as f64 * self.multiplier.powi(exp);
        let capped = millis.min(self.max.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Delay before the next attempt, `attempt` counting from zero.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let spread = base.as_millis() as f64 * self.jitter;
        let offset = rand::rng().random_range(-spread..=spread);
        let millis = (base.as_millis() as f64 + offset).max(0.0);
        Duration::from_millis(millis as u64)
    }
}
