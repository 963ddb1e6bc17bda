//! Time utilities
//!
//! Monotonic timers for periodic work and wall-clock helpers for the values
//! that travel or are bucketed by wall time (session ids, repair buckets).

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Seconds since the Unix epoch
pub fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Timer for periodic operations
///
/// Used for lookup broadcasts, directory maintenance and statistics output.
pub struct Timer {
    interval: Duration,
    last_fire: Instant,
}

impl Timer {
    /// Create a new timer with the given interval, starting now
    pub fn new(interval: Duration) -> Self {
        Timer {
            interval,
            last_fire: Instant::now(),
        }
    }

    /// Create a timer that is already expired
    pub fn expired_now(interval: Duration) -> Self {
        let now = Instant::now();
        Timer {
            interval,
            last_fire: now.checked_sub(interval).unwrap_or(now),
        }
    }

    /// Timer interval
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Check if the timer has expired
    pub fn expired(&self) -> bool {
        self.last_fire.elapsed() >= self.interval
    }

    /// Reset the timer
    pub fn reset(&mut self) {
        self.last_fire = Instant::now();
    }

    /// Get time until next expiration
    pub fn time_until_expiration(&self) -> Duration {
        self.interval.saturating_sub(self.last_fire.elapsed())
    }

    /// Fire the timer if expired, returning true if it fired
    pub fn try_fire(&mut self) -> bool {
        if self.expired() {
            self.reset();
            true
        } else {
            false
        }
    }
}
