//! Capped exponential reconnect backoff.

use std::time::Duration;

pub const DEFAULT_RECONNECT_FLOOR: Duration = Duration::from_millis(100);
pub const DEFAULT_RECONNECT_CAP: Duration = Duration::from_millis(2_500);

/// Doubling delay between reconnect attempts, clamped to `[floor, cap]`.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    floor: Duration,
    cap: Duration,
    current: Duration,
    attempts: u32,
}

impl ReconnectBackoff {
    pub fn new(floor: Duration, cap: Duration) -> Self {
        let cap = cap.max(floor);
        Self {
            floor,
            cap,
            current: floor,
            attempts: 0,
        }
    }

    /// Delay to wait before the next attempt. Advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.cap);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    /// Back to the floor after a successful open.
    pub fn reset(&mut self) {
        self.current = self.floor;
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_RECONNECT_FLOOR, DEFAULT_RECONNECT_CAP)
    }
}
