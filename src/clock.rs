//! Time source abstraction.
//!
//! Every component reads time through a [`Clock`] so window, bucket, block
//! and quota behavior can be driven deterministically in tests.

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use std::time::Duration;

/// A source of the current time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    current: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a manual clock starting at the given time.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current: Mutex::new(start),
        }
    }

    /// Create a manual clock starting at the current wall time.
    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut current = self.current.lock();
        *current = plus_ms(*current, duration_ms(by));
    }

    /// Jump to an absolute time.
    pub fn set(&self, to: DateTime<Utc>) {
        *self.current.lock() = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::starting_now()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock()
    }
}

/// Milliseconds elapsed from `earlier` to `later`, clamped at zero.
pub(crate) fn elapsed_ms(earlier: DateTime<Utc>, later: DateTime<Utc>) -> i64 {
    (later - earlier).num_milliseconds().max(0)
}

/// `at` shifted by `ms` milliseconds, saturating at the representable range.
pub(crate) fn plus_ms(at: DateTime<Utc>, ms: i64) -> DateTime<Utc> {
    TimeDelta::try_milliseconds(ms)
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(if ms >= 0 {
            DateTime::<Utc>::MAX_UTC
        } else {
            DateTime::<Utc>::MIN_UTC
        })
}

/// Whole milliseconds in `duration`, saturating at `i64::MAX`.
pub(crate) fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::starting_now();
        let start = clock.now();
        clock.advance(Duration::from_millis(1500));
        assert_eq!(elapsed_ms(start, clock.now()), 1500);
    }

    #[test]
    fn test_elapsed_never_negative() {
        let clock = ManualClock::starting_now();
        let start = clock.now();
        clock.set(start - chrono::Duration::seconds(5));
        assert_eq!(elapsed_ms(start, clock.now()), 0);
    }

    #[test]
    fn test_plus_ms_saturates() {
        let now = Utc::now();
        assert_eq!(plus_ms(now, i64::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(plus_ms(now, i64::MIN), DateTime::<Utc>::MIN_UTC);
        assert_eq!(plus_ms(now, 1500) - now, TimeDelta::milliseconds(1500));
    }

    #[test]
    fn test_duration_ms_saturates() {
        assert_eq!(duration_ms(Duration::from_millis(42)), 42);
        assert_eq!(duration_ms(Duration::MAX), i64::MAX);
    }
}
