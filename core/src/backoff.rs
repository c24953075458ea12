use std::time::Duration;

use rand::Rng;

/// Exponential backoff with a cap, jitter and an optional attempt budget.
///
/// The n-th delay (n starting at 1) is `base * factor^(n - 1)`, scaled by a random
/// factor in `[1 - jitter, 1 + jitter]` and capped at `max_interval`. Once
/// `max_attempts` delays have been handed out the iterator is exhausted, which
/// callers treat as "give up".
#[derive(Debug, Clone)]
pub struct Exponential {
    base_interval: Duration,
    max_interval: Duration,
    factor: f64,
    jitter: f64,
    max_attempts: Option<u32>,
    current_attempt: u32,
}

impl Exponential {
    pub fn new(
        base_interval: Duration,
        max_interval: Duration,
        factor: f64,
        jitter: f64,
        max_attempts: Option<u32>,
    ) -> Self {
        Self {
            base_interval,
            max_interval,
            factor,
            jitter: jitter.clamp(0.0, 1.0),
            max_attempts,
            current_attempt: 0,
        }
    }

    pub fn from_millis(
        base_interval_ms: u64,
        max_interval_ms: u64,
        factor: f64,
        jitter: f64,
        max_attempts: Option<u32>,
    ) -> Self {
        Self::new(
            Duration::from_millis(base_interval_ms),
            Duration::from_millis(max_interval_ms),
            factor,
            jitter,
            max_attempts,
        )
    }

    /// Number of delays handed out so far.
    pub fn current_attempt(&self) -> u32 {
        self.current_attempt
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let mut delay_ms = self.base_interval.as_millis() as f64 * self.factor.powi(exponent);

        if self.jitter > 0.0 {
            let spread = rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter);
            delay_ms *= spread;
        }

        let cap_ms = self.max_interval.as_millis() as f64;
        Duration::from_millis(delay_ms.min(cap_ms).max(0.0) as u64)
    }
}

impl Iterator for Exponential {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(max_attempts) = self.max_attempts {
            if self.current_attempt >= max_attempts {
                return None;
            }
        }
        self.current_attempt += 1;
        Some(self.delay_for(self.current_attempt))
    }
}
