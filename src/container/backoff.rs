use std::time::Duration;

use rand::Rng;

use crate::container::config::BackoffConfig;

/// Exponential delay for retrying failed receive calls.
#[derive(Debug, Clone)]
pub(crate) struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    jitter: bool,
}

impl ExponentialBackoff {
    pub(crate) fn new(config: &BackoffConfig) -> Self {
        ExponentialBackoff {
            initial: Duration::from_millis(config.initial_delay_millis),
            max: Duration::from_millis(config.max_delay_millis),
            jitter: config.jitter,
        }
    }

    /// Delay before retry number `attempt` (starting at 1).
    ///
    /// Doubles per attempt up to the cap. With jitter the result is drawn
    /// uniformly from the upper half of the capped delay.
    pub(crate) fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let capped = self
            .initial
            .saturating_mul(1u32 << exponent)
            .min(self.max);

        if !self.jitter || capped.is_zero() {
            return capped;
        }
        let millis = capped.as_millis() as u64;
        let low = millis / 2;
        Duration::from_millis(rand::rng().random_range(low..=millis))
    }
}
