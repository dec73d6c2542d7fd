//! Sliding-window write throttle protecting the router API (spec §4.1).
//!
//! Deliberately not persisted across restarts — see `DESIGN.md`. Uses
//! [`Clock`] exclusively so a process restart or NTP step never reopens or
//! corrupts the window.

use crate::clock::{Clock, Instant};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    window: Duration,
    max_changes: u32,
    timestamps: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(clock: Arc<dyn Clock>, window: Duration, max_changes: u32) -> Self {
        RateLimiter {
            clock,
            window,
            max_changes,
            timestamps: VecDeque::new(),
        }
    }

    fn evict_expired(&mut self, now: Instant) {
        while let Some(&front) = self.timestamps.front() {
            if now.duration_since(front) > self.window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// True iff a write would be accepted right now.
    pub fn can_change(&mut self) -> bool {
        let now = self.clock.now();
        self.evict_expired(now);
        self.timestamps.len() < self.max_changes as usize
    }

    /// Records an accepted write. Callers must have just checked
    /// [`can_change`](Self::can_change); this does not re-check.
    pub fn record_change(&mut self) {
        let now = self.clock.now();
        self.evict_expired(now);
        self.timestamps.push_back(now);
    }

    /// Time until the oldest entry in the window expires, clamped at zero.
    pub fn time_until_available(&mut self) -> Duration {
        let now = self.clock.now();
        self.evict_expired(now);
        if self.timestamps.len() < self.max_changes as usize {
            return Duration::ZERO;
        }
        let earliest = *self.timestamps.front().expect("len checked above");
        let elapsed = now.duration_since(earliest);
        self.window.saturating_sub(elapsed)
    }
}
