//! Activity model driving the lane gates.
//!
//! Unlike a UI, the memory core has exactly one traffic signal: the query
//! engine pokes [`ActivityDetector::heartbeat`] on every request. The
//! current level is therefore not a stored state machine but a pure
//! function of how long ago that traffic stopped, asked at the moment a
//! worker wants to pop a task. An embedding application can still pin a
//! level explicitly (e.g. SleepMode when the window minimizes); the pin
//! holds until traffic resumes.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Current level of user activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityLevel {
    /// Queries are flowing; only urgent tasks execute.
    HighActivity,

    /// Idle past the low threshold; urgent and normal tasks execute.
    LowActivity,

    /// Idle past the sleep threshold; every priority executes, including
    /// lifecycle transitions and consolidation.
    SleepMode,
}

/// Derives the activity level from request-path traffic.
pub struct ActivityDetector {
    booted: Instant,
    last_heartbeat: Option<Instant>,
    pinned: Option<ActivityLevel>,
    low_after: Duration,
    sleep_after: Duration,
}

impl ActivityDetector {
    /// Creates a detector with the given idle thresholds.
    pub fn new(low_after: Duration, sleep_after: Duration) -> Self {
        Self {
            booted: Instant::now(),
            last_heartbeat: None,
            pinned: None,
            low_after,
            sleep_after,
        }
    }

    /// Records request-path traffic. Clears any pinned level: real queries
    /// outrank whatever the application declared.
    pub fn heartbeat(&mut self) {
        self.pinned = None;
        self.last_heartbeat = Some(Instant::now());
    }

    /// Pins a level until the next heartbeat.
    pub fn pin(&mut self, level: ActivityLevel) {
        self.pinned = Some(level);
    }

    /// How long the request path has been quiet.
    ///
    /// A process that has never served a query counts as idle since one
    /// low-threshold before boot, so background work starts at LowActivity
    /// rather than being frozen out by a phantom burst of traffic.
    pub fn idle_for(&self) -> Duration {
        match self.last_heartbeat {
            Some(at) => at.elapsed(),
            None => self.booted.elapsed() + self.low_after,
        }
    }

    /// The level right now, derived from idle time (or the pin).
    pub fn level(&self) -> ActivityLevel {
        if let Some(level) = self.pinned {
            return level;
        }
        let idle = self.idle_for();
        if idle >= self.sleep_after {
            ActivityLevel::SleepMode
        } else if idle >= self.low_after {
            ActivityLevel::LowActivity
        } else {
            ActivityLevel::HighActivity
        }
    }
}
