//! Exponential reconnect backoff with full jitter (SPEC_FULL.md ss4.6a).

use std::time::Duration;

use rand::Rng as _;

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max,
            multiplier,
            current: initial,
        }
    }

    /// Returns the jittered delay for the next attempt and advances the
    /// sequence for the one after.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let next = self.current.mul_f64(self.multiplier);
        self.current = next.min(self.max);
        jitter(delay)
    }

    /// Reset to the initial delay after a successful reconnect.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

fn jitter(delay: Duration) -> Duration {
    if delay.is_zero() {
        return delay;
    }
    let millis = delay.as_millis().max(1) as u64;
    let jittered = rand::rng().random_range(0..=millis);
    Duration::from_millis(jittered)
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(60), 2.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_never_exceeds_max() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(500), 2.0);
        for _ in 0..10 {
            let delay = backoff.next_delay();
            assert!(delay <= Duration::from_millis(500));
        }
    }

    #[test]
    fn reset_returns_to_initial() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(10), 2.0);
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.current, backoff.initial);
    }

    #[test]
    fn zero_initial_delay_stays_zero() {
        let mut backoff = Backoff::new(Duration::ZERO, Duration::from_secs(1), 2.0);
        assert_eq!(backoff.next_delay(), Duration::ZERO);
    }
}
