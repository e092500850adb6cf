//! Time sources shared by the scheduler and the lock managers.
//!
//! Every component in this crate reads time through a [`Clock`] handed to it
//! at construction, so tests can substitute a [`MockClock`] and drive
//! deadlines deterministically.

use core::sync::atomic::{AtomicI64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use log::trace;

/// Microseconds per millisecond.
pub const MS_US: i64 = 1_000;

/// A monotonic time source with microsecond resolution.
pub trait Clock: Send + Sync {
    /// Returns the current time in microseconds.
    fn now_us(&self) -> i64;

    /// Returns the current time in milliseconds.
    fn now_ms(&self) -> i64 {
        self.now_us() / MS_US
    }

    /// Gives the clock a chance to jump straight to `wakeup_us` instead of
    /// having the caller block until then.
    ///
    /// Returns `true` if the clock has advanced, in which case the caller must
    /// not block. Real clocks return `false`.
    fn advance_to_us(&self, wakeup_us: i64) -> bool {
        let _ = wakeup_us;
        false
    }
}

/// The wall clock, kept monotonic by anchoring an [`Instant`] to the UNIX epoch
/// once at construction.
#[derive(Debug)]
pub struct SystemClock {
    epoch_us: i64,
    start: Instant,
}

impl SystemClock {
    /// Creates a new system clock anchored at the current wall time.
    pub fn new() -> Self {
        let since_epoch = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        let epoch_us = i64::try_from(since_epoch.as_micros()).unwrap_or(i64::MAX);
        Self { epoch_us, start: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_us(&self) -> i64 {
        let elapsed = i64::try_from(self.start.elapsed().as_micros()).unwrap_or(i64::MAX);
        self.epoch_us.saturating_add(elapsed)
    }
}

/// A manually driven clock.
///
/// Time only moves forward: a request to set a time earlier than the current
/// one is dropped. When installed in a [`Scheduler`], blocking waits advance
/// the clock to their deadline instead of sleeping.
///
/// [`Scheduler`]: crate::scheduler::Scheduler
///
/// # Example
///
/// ```
/// use namedlock::clock::{Clock, MockClock};
///
/// let clock = MockClock::new(0);
/// clock.advance_ms(10);
/// clock.set_time_ms(5);
/// assert_eq!(clock.now_ms(), 10);
/// ```
#[derive(Debug, Default)]
pub struct MockClock {
    now_us: AtomicI64,
}

impl MockClock {
    /// Creates a mock clock reading `start_us`.
    pub const fn new(start_us: i64) -> Self {
        Self { now_us: AtomicI64::new(start_us) }
    }

    /// Moves the clock to `time_us`, unless that would move it backwards.
    pub fn set_time_us(&self, time_us: i64) {
        let prev = self.now_us.fetch_max(time_us, Ordering::AcqRel);
        if time_us < prev {
            trace!("mock clock ignored regression from {prev}us to {time_us}us");
        }
    }

    /// Moves the clock to `time_ms`, unless that would move it backwards.
    pub fn set_time_ms(&self, time_ms: i64) {
        self.set_time_us(time_ms.saturating_mul(MS_US));
    }

    /// Moves the clock forward by `delta_us`.
    pub fn advance_us(&self, delta_us: i64) {
        if delta_us > 0 {
            self.now_us.fetch_add(delta_us, Ordering::AcqRel);
        }
    }

    /// Moves the clock forward by `delta_ms`.
    pub fn advance_ms(&self, delta_ms: i64) {
        self.advance_us(delta_ms.saturating_mul(MS_US));
    }
}

impl Clock for MockClock {
    fn now_us(&self) -> i64 {
        self.now_us.load(Ordering::Acquire)
    }

    fn advance_to_us(&self, wakeup_us: i64) -> bool {
        self.set_time_us(wakeup_us);
        true
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use super::{Clock, MockClock, SystemClock, MS_US};

    #[test]
    fn mock_clock_never_regresses() {
        let clock = MockClock::new(5 * MS_US);
        clock.set_time_us(MS_US);
        assert_eq!(clock.now_ms(), 5);
        clock.advance_us(-MS_US);
        assert_eq!(clock.now_ms(), 5);
        clock.set_time_ms(7);
        assert_eq!(clock.now_us(), 7 * MS_US);
    }

    #[test]
    fn mock_clock_advances_instead_of_blocking() {
        let clock = MockClock::new(0);
        assert!(clock.advance_to_us(1_500));
        assert_eq!(clock.now_us(), 1_500);
        assert_eq!(clock.now_ms(), 1);
    }

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        assert!(!clock.advance_to_us(0));
        let first = clock.now_us();
        let second = clock.now_us();
        assert!(first > 0);
        assert!(second >= first);
    }
}
