//! Exponential backoff with jitter.
//!
//! Shared by the dispatch loop (idle polling) and the node reconnect loop.

use std::time::Duration;

use rand::Rng;

/// Tunable parameters for an exponential-backoff strategy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
    /// Fraction of the delay randomly added or removed, `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }
}

/// Calculate the next backoff delay from the current delay and config.
///
/// The result is clamped to [`BackoffConfig::max_delay`].
pub fn next_delay(current: Duration, config: &BackoffConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}

/// Spread `delay` by up to `jitter` of itself in either direction.
pub fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    let jitter = jitter.clamp(0.0, 1.0);
    if jitter == 0.0 || delay.is_zero() {
        return delay;
    }
    let factor = rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter));
    delay.mul_f64(factor)
}

/// Stateful backoff: `next()` yields the delay to sleep, `reset()` returns
/// to the initial delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            current: config.initial_delay,
            config,
            attempts: 0,
        }
    }

    /// Delay for this attempt (with jitter), advancing the schedule.
    pub fn next(&mut self) -> Duration {
        let delay = apply_jitter(self.current, self.config.jitter);
        self.current = next_delay(self.current, &self.config);
        self.attempts += 1;
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.config.initial_delay;
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_delay_doubles() {
        let config = BackoffConfig::default();
        assert_eq!(next_delay(Duration::from_secs(1), &config), Duration::from_secs(2));
    }

    #[test]
    fn next_delay_clamps_at_max() {
        let config = BackoffConfig {
            max_delay: Duration::from_secs(10),
            ..Default::default()
        };
        assert_eq!(next_delay(Duration::from_secs(8), &config), Duration::from_secs(10));
    }

    #[test]
    fn full_sequence_without_jitter() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        let observed: Vec<u64> = (0..8).map(|_| backoff.next().as_secs()).collect();
        assert_eq!(observed, vec![1, 2, 4, 8, 16, 30, 30, 30]);
        assert_eq!(backoff.attempts(), 8);
    }

    #[test]
    fn reset_returns_to_initial() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        backoff.next();
        backoff.next();
        backoff.reset();
        assert_eq!(backoff.next(), Duration::from_secs(1));
        assert_eq!(backoff.attempts(), 1);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_millis(1000);
        for _ in 0..100 {
            let d = apply_jitter(base, 0.25);
            assert!(d >= Duration::from_millis(750) && d <= Duration::from_millis(1250));
        }
    }

    #[test]
    fn zero_jitter_is_identity() {
        let base = Duration::from_millis(400);
        assert_eq!(apply_jitter(base, 0.0), base);
    }
}
