use std::time::Duration;

use rand::Rng;

/// Reconnect pacing: exponentially growing delays with a cap and a random
///  jitter so that many subscribers losing the same publisher do not retry in
///  lock step.
#[derive(Debug, Clone)]
pub struct RetryBackoff {
    pub base: Duration,
    pub cap: Duration,
    pub factor: u32,
    /// fraction of the delay randomly added or subtracted, 0.0..1.0
    pub jitter: f64,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        RetryBackoff {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            factor: 2,
            jitter: 0.25,
        }
    }
}

impl RetryBackoff {
    /// The delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let unjittered = self.unjittered_delay(attempt);
        if self.jitter <= 0.0 {
            return unjittered;
        }

        let spread = unjittered.as_secs_f64() * self.jitter;
        let jittered = unjittered.as_secs_f64() + rand::rng().random_range(-spread..=spread);
        Duration::from_secs_f64(jittered.max(0.0))
    }

    fn unjittered_delay(&self, attempt: u32) -> Duration {
        let factor = (self.factor as u64).saturating_pow(attempt);
        let delay = self.base.saturating_mul(factor.min(u32::MAX as u64) as u32);
        delay.min(self.cap)
    }
}
