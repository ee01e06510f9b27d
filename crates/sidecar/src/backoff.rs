//! Restart backoff: a single current delay, multiplied on failure and capped.

use std::time::Duration;

/// Exponential restart delay.
///
/// [`Backoff::advance`] hands out the current delay and multiplies it for the
/// next failure; [`Backoff::reset`] puts it back at the floor. The delay never
/// exceeds the ceiling.
#[derive(Clone, Debug)]
pub struct Backoff {
    floor: Duration,
    ceiling: Duration,
    multiplier: f64,
    current: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(floor: Duration, ceiling: Duration, multiplier: f64) -> Self {
        let floor = floor.min(ceiling);
        Self {
            floor,
            ceiling,
            multiplier: multiplier.max(1.0),
            current: floor,
            attempt: 0,
        }
    }

    /// Delay to wait before the next restart attempt, advancing the sequence.
    pub fn advance(&mut self) -> Duration {
        let delay = self.current;
        let next_ms = (self.current.as_millis() as f64 * self.multiplier)
            .min(self.ceiling.as_millis() as f64);
        // f64 -> u64 saturates, so an overflowing product still lands on the ceiling.
        self.current = Duration::from_millis(next_ms as u64).min(self.ceiling);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.floor;
        self.attempt = 0;
    }

    /// Delay the next [`Backoff::advance`] will return.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn floor(&self) -> Duration {
        self.floor
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 2.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_capped() {
        let mut backoff = Backoff::new(
            Duration::from_millis(100),
            Duration::from_millis(500),
            2.0,
        );

        assert_eq!(backoff.advance(), Duration::from_millis(100));
        assert_eq!(backoff.advance(), Duration::from_millis(200));
        assert_eq!(backoff.advance(), Duration::from_millis(400));
        assert_eq!(backoff.advance(), Duration::from_millis(500));
        assert_eq!(backoff.advance(), Duration::from_millis(500));
        assert_eq!(backoff.attempt(), 5);
    }

    #[test]
    fn never_exceeds_ceiling() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60), 10.0);
        for _ in 0..200 {
            assert!(backoff.advance() <= Duration::from_secs(60));
        }
        assert_eq!(backoff.current(), Duration::from_secs(60));
    }

    #[test]
    fn reset_returns_to_floor() {
        let mut backoff = Backoff::default();
        backoff.advance();
        backoff.advance();
        assert_eq!(backoff.current(), Duration::from_secs(4));

        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_secs(1));
        assert_eq!(backoff.attempt(), 0);
    }

    #[test]
    fn floor_above_ceiling_is_clamped() {
        let mut backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(2), 2.0);
        assert_eq!(backoff.advance(), Duration::from_secs(2));
        assert_eq!(backoff.floor(), Duration::from_secs(2));
    }
}
