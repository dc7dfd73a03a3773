//! Bounded exponential backoff between duplex reconnect attempts.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    initial_delay: Duration,
    max_delay: Duration,
    /// 0 means unlimited.
    max_attempts: u32,
    attempts: u32,
    current: Duration,
}

impl Backoff {
    pub fn new(initial_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        let max_delay = max_delay.max(initial_delay);
        Self {
            initial_delay,
            max_delay,
            max_attempts,
            attempts: 0,
            current: initial_delay,
        }
    }

    /// Delay before the next attempt, or `None` once attempts are used up.
    /// Each call doubles the following delay, capped at `max_delay`.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.exhausted() {
            return None;
        }
        let delay = self.current;
        self.attempts += 1;
        self.current = self.current.saturating_mul(2).min(self.max_delay);
        Some(delay)
    }

    /// Call after a successful connection.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current = self.initial_delay;
    }

    pub fn exhausted(&self) -> bool {
        self.max_attempts != 0 && self.attempts >= self.max_attempts
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(250), Duration::from_secs(8), 0)
    }
}
