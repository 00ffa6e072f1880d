//! Resettable deadline predicate
//!
//! A [`TimeoutTrigger`] pairs a start time with a duration and answers the
//! question "has the deadline passed?". Drivers poll it between steps:
//!
//! ```rust
//! use std::time::Duration;
//! use taskomat::TimeoutTrigger;
//!
//! let mut trigger = TimeoutTrigger::default();
//! trigger.reset(Duration::from_millis(100));
//! while !trigger.is_elapsed() {
//!     std::thread::sleep(Duration::from_millis(10));
//! }
//! ```

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Evaluates when a timeout has elapsed.
///
/// A default-constructed trigger is disarmed: its start time is the Unix
/// epoch and [`is_elapsed()`](TimeoutTrigger::is_elapsed) stays false until
/// [`reset()`](TimeoutTrigger::reset) arms it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutTrigger {
    start: DateTime<Utc>,
    timeout: Duration,
}

impl Default for TimeoutTrigger {
    fn default() -> Self {
        Self {
            start: DateTime::UNIX_EPOCH,
            timeout: Duration::MAX,
        }
    }
}

impl TimeoutTrigger {
    /// Create a disarmed trigger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the trigger: restart the clock now and set the timeout measured by
    /// [`is_elapsed()`](TimeoutTrigger::is_elapsed).
    pub fn reset(&mut self, timeout: Duration) {
        self.timeout = timeout;
        self.start = Utc::now();
    }

    /// Return the point in time at which the trigger was last armed, or the
    /// Unix epoch if it never was.
    pub fn get_start_time(&self) -> DateTime<Utc> {
        self.start
    }

    /// Return the configured timeout.
    pub fn get_timeout(&self) -> Duration {
        self.timeout
    }

    /// Check whether the timeout has elapsed since the trigger was armed.
    ///
    /// Always false for a disarmed trigger. The deadline saturates at the
    /// maximum representable millisecond count.
    pub fn is_elapsed(&self) -> bool {
        if self.start == DateTime::UNIX_EPOCH {
            return false;
        }
        let timeout_ms = i64::try_from(self.timeout.as_millis()).unwrap_or(i64::MAX);
        let deadline_ms = self.start.timestamp_millis().saturating_add(timeout_ms);
        Utc::now().timestamp_millis() >= deadline_ms
    }
}
