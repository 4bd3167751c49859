//! Time source abstraction.
//!
//! Staleness and retention deadlines are computed from an injected clock so
//! tests can drive expiry deterministically instead of sleeping.

use std::sync::Mutex;
use std::time::Duration;

use time::OffsetDateTime;

use crate::lock::mutex_lock;

const SOURCE: &str = "requery::clock";

/// Provides the current instant for deadline computation.
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

/// Wall-clock time. The default for production engines.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// A manually advanced clock for tests.
///
/// Starts at an arbitrary fixed instant; `advance` moves it forward.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Start at the UNIX epoch.
    pub fn at_epoch() -> Self {
        Self::new(OffsetDateTime::UNIX_EPOCH)
    }

    pub fn advance(&self, by: Duration) {
        let mut now = mutex_lock(&self.now, SOURCE, "advance");
        *now += by;
    }

    pub fn set(&self, to: OffsetDateTime) {
        *mutex_lock(&self.now, SOURCE, "set") = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *mutex_lock(&self.now, SOURCE, "now")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::at_epoch();
        let start = clock.now();

        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.now() - start, time::Duration::milliseconds(1500));
    }

    #[test]
    fn manual_clock_set_overrides() {
        let clock = ManualClock::at_epoch();
        let target = OffsetDateTime::UNIX_EPOCH + time::Duration::days(1);

        clock.set(target);
        assert_eq!(clock.now(), target);
    }

    #[test]
    fn system_clock_is_monotonic_enough() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
