//! Reconnect backoff shared by both connection managers

use crate::config::ReconnectConfig;
use std::time::Duration;
use tokio::time::Instant;

/// Exponential reconnect delay with a stability reset
///
/// The delay starts at `min_delay`, grows by `multiplier` after every
/// failed attempt and is capped at `max_delay`. It only returns to
/// `min_delay` once a connection has stayed up for `stable_period`, so a
/// link that flaps quickly keeps backing off.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    multiplier: f64,
    stable_period: Duration,
    current: Duration,
    connected_since: Option<Instant>,
}

impl Backoff {
    /// Create a backoff from reconnect settings
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            min: config.min_delay,
            max: config.max_delay,
            multiplier: config.multiplier.max(1.0),
            stable_period: config.stable_period,
            current: config.min_delay,
            connected_since: None,
        }
    }

    /// Delay to wait before the next attempt, advancing the schedule
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.mul_f64(self.multiplier).min(self.max);
        delay
    }

    /// Delay the next call to [`Backoff::next_delay`] will return
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Record a successful connection
    pub fn connected(&mut self, at: Instant) {
        self.connected_since = Some(at);
    }

    /// Record a lost connection
    ///
    /// Resets the schedule if the connection had been up for at least the
    /// stable period.
    pub fn disconnected(&mut self, at: Instant) {
        if let Some(since) = self.connected_since.take() {
            if at.saturating_duration_since(since) >= self.stable_period {
                self.reset();
            }
        }
    }

    /// Return to the minimum delay
    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ReconnectConfig {
        ReconnectConfig {
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            stable_period: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_growth_and_cap() {
        let mut backoff = Backoff::new(&config());
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);
    }

    #[test]
    fn test_flapping_does_not_reset() {
        let mut backoff = Backoff::new(&config());
        let start = Instant::now();
        let mut last = Duration::ZERO;
        for i in 0..8u64 {
            let delay = backoff.next_delay();
            assert!(delay >= last, "delay decreased at attempt {}", i);
            last = delay;
            // up for 5s each time, below the stable period
            let at = start + Duration::from_secs(i * 20);
            backoff.connected(at);
            backoff.disconnected(at + Duration::from_secs(5));
        }
        assert_eq!(last, Duration::from_secs(10));
    }

    #[test]
    fn test_reset_after_stable_period() {
        let mut backoff = Backoff::new(&config());
        for _ in 0..5 {
            backoff.next_delay();
        }
        let at = Instant::now();
        backoff.connected(at);
        backoff.disconnected(at + Duration::from_secs(31));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_disconnect_without_connect_keeps_schedule() {
        let mut backoff = Backoff::new(&config());
        backoff.next_delay();
        backoff.disconnected(Instant::now());
        assert_eq!(backoff.current(), Duration::from_secs(2));
    }
}
