//! A cooperative alarm scheduler.
//!
//! The [`Scheduler`] keeps a queue of alarms ordered by deadline and runs each
//! one once its deadline has passed. Alarms run on whichever thread happens to
//! drive the scheduler, through [`Scheduler::process_alarms`] or while waiting
//! in [`SchedulerGuard::blocking_timed_wait`]. Alarm callbacks always run with
//! the scheduler mutex released, so they may call back into the scheduler.
//!
//! Operations that must observe a consistent queue are exposed on
//! [`SchedulerGuard`], obtained through [`Scheduler::lock`]. The guard owns the
//! scheduler mutex for its lifetime, except while a callback runs.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicBool, Ordering};
//!
//! use namedlock::action::action;
//! use namedlock::clock::MockClock;
//! use namedlock::scheduler::Scheduler;
//!
//! let clock = Arc::new(MockClock::new(0));
//! let scheduler = Scheduler::new(clock.clone());
//! let fired = Arc::new(AtomicBool::new(false));
//! let flag = Arc::clone(&fired);
//! scheduler.add_alarm_at_us(5_000, action(move || flag.store(true, Ordering::Release), || {}));
//!
//! // Nothing is due yet, so the scheduler advances the mock clock.
//! assert!(scheduler.process_alarms(10_000));
//! assert!(fired.load(Ordering::Acquire));
//! ```

use core::fmt;
use core::mem;
use core::time::Duration;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use log::{debug, trace};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::action::BoxAction;
use crate::clock::{Clock, MS_US};

mod alarm;

pub use alarm::AlarmId;

use alarm::{Alarm, AlarmKey};

/// Runs time ordered alarms and hosts cooperative timed waits.
pub struct Scheduler {
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
    condvar: Condvar,
}

#[derive(Debug, Default)]
struct State {
    next_index: u64,
    signal_count: u64,
    outstanding: BTreeMap<AlarmKey, Alarm>,
    // Subset of `outstanding` that belongs to timed waits.
    waiting: BTreeSet<AlarmKey>,
}

impl Scheduler {
    /// Creates a scheduler reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock, state: Mutex::new(State::default()), condvar: Condvar::new() }
    }

    /// The time source of this scheduler.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Acquires the scheduler mutex.
    pub fn lock(&self) -> SchedulerGuard<'_> {
        SchedulerGuard { scheduler: self, state: self.state.lock() }
    }

    /// Schedules `action` to run at `wakeup_us`, then runs every due alarm.
    pub fn add_alarm_at_us(&self, wakeup_us: i64, action: BoxAction) -> AlarmId {
        self.lock().add_alarm_at_us(wakeup_us, action)
    }

    /// Cancels the alarm behind `id`. See [`SchedulerGuard::cancel_alarm`].
    pub fn cancel_alarm(&self, id: AlarmId) -> bool {
        self.lock().cancel_alarm(id)
    }

    /// Wakes every timed waiter. See [`SchedulerGuard::signal`].
    pub fn signal(&self) {
        self.lock().signal();
    }

    /// Runs due alarms. If none were due, waits up to `timeout_us` or until
    /// the next deadline, whichever comes first, and runs due alarms again.
    ///
    /// Returns whether any alarm ran.
    pub fn process_alarms(&self, timeout_us: i64) -> bool {
        let mut guard = self.lock();
        let mut ran = false;
        let finish_us = guard.now_us().saturating_add(timeout_us);
        let next_wakeup_us = guard.run_due_alarms(&mut ran);
        if timeout_us > 0 && !ran {
            let wakeup_us = next_wakeup_us.map_or(finish_us, |next| next.min(finish_us));
            guard.await_wakeup(wakeup_us);
            guard.run_due_alarms(&mut ran);
        }
        ran
    }

    /// Broadcasts the condition variable so blocked waiters re-examine their
    /// state. Does not touch the signal counter.
    pub fn wakeup(&self) {
        self.condvar.notify_all();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        state.waiting.clear();
        let outstanding = mem::take(&mut state.outstanding);
        if !outstanding.is_empty() {
            debug!("scheduler dropped with {} outstanding alarms", outstanding.len());
        }
        for alarm in outstanding.into_values() {
            alarm.cancel();
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler").field("state", &self.state).finish_non_exhaustive()
    }
}

/// Exclusive access to the scheduler queue.
///
/// Dropping the guard releases the scheduler mutex.
pub struct SchedulerGuard<'a> {
    scheduler: &'a Scheduler,
    state: MutexGuard<'a, State>,
}

impl SchedulerGuard<'_> {
    /// Current time of the scheduler clock, in microseconds.
    pub fn now_us(&self) -> i64 {
        self.scheduler.clock.now_us()
    }

    /// Current time of the scheduler clock, in milliseconds.
    pub fn now_ms(&self) -> i64 {
        self.scheduler.clock.now_ms()
    }

    /// Number of signals delivered so far. Never decreases.
    pub fn signal_count(&self) -> u64 {
        self.state.signal_count
    }

    /// Deadline of the earliest outstanding alarm, if any.
    pub fn next_wakeup_us(&self) -> Option<i64> {
        self.state.outstanding.keys().next().map(|key| key.wakeup_us)
    }

    /// Schedules `action` to run at `wakeup_us`, then runs every due alarm.
    ///
    /// The returned handle may already refer to a fired alarm if `wakeup_us`
    /// is not in the future.
    pub fn add_alarm_at_us(&mut self, wakeup_us: i64, action: BoxAction) -> AlarmId {
        let id = self.insert_alarm_at_us(wakeup_us, action);
        self.run_alarms();
        id
    }

    /// Schedules `action` to run at `wakeup_us` without running anything and
    /// without releasing the mutex.
    pub fn insert_alarm_at_us(&mut self, wakeup_us: i64, action: BoxAction) -> AlarmId {
        AlarmId(self.insert(wakeup_us, Alarm::User(action)))
    }

    /// Cancels the alarm behind `id`, running its cancel path with the mutex
    /// released.
    ///
    /// Returns `false` if the alarm already ran, was cancelled, or is about to
    /// run on another thread.
    pub fn cancel_alarm(&mut self, id: AlarmId) -> bool {
        let Some(alarm) = self.state.outstanding.remove(&id.0) else {
            return false;
        };
        self.state.waiting.remove(&id.0);
        trace!("cancelling alarm {:?}", id.0);
        MutexGuard::unlocked(&mut self.state, || alarm.cancel());
        true
    }

    /// Runs every alarm whose deadline has passed.
    ///
    /// Returns the deadline of the next outstanding alarm, or `None` if the
    /// queue is empty.
    pub fn run_alarms(&mut self) -> Option<i64> {
        let mut ran = false;
        self.run_due_alarms(&mut ran)
    }

    /// Blocks until the next [`signal`], until `timeout_ms` elapses, or until
    /// no alarm remains outstanding. Due alarms run while waiting.
    ///
    /// [`signal`]: SchedulerGuard::signal
    pub fn blocking_timed_wait(&mut self, timeout_ms: i64) {
        let signal_count = self.state.signal_count;
        let deadline_us = self.now_us().saturating_add(timeout_ms.saturating_mul(MS_US));
        let key = self.insert(deadline_us, Alarm::Deadline);
        self.state.waiting.insert(key);
        let mut next_wakeup_us = self.run_alarms();
        while self.state.signal_count == signal_count && self.state.outstanding.contains_key(&key) {
            let Some(next) = next_wakeup_us else { break };
            self.await_wakeup(next.min(deadline_us));
            next_wakeup_us = self.run_alarms();
        }
        if self.state.outstanding.remove(&key).is_some() {
            self.state.waiting.remove(&key);
        }
    }

    /// Arranges for `callback` to run once, after `timeout_ms` or on the next
    /// [`signal`], whichever comes first.
    ///
    /// [`signal`]: SchedulerGuard::signal
    pub fn timed_wait<F>(&mut self, timeout_ms: i64, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let deadline_us = self.now_us().saturating_add(timeout_ms.saturating_mul(MS_US));
        let key = self.insert(deadline_us, Alarm::Wait(Box::new(callback)));
        self.state.waiting.insert(key);
        self.run_alarms();
    }

    /// Releases every current timed waiter.
    ///
    /// Increments the signal counter, runs the callback of every pending
    /// [`timed_wait`], wakes every [`blocking_timed_wait`], then runs due
    /// alarms. Waiters registered after this call are not affected.
    ///
    /// [`timed_wait`]: SchedulerGuard::timed_wait
    /// [`blocking_timed_wait`]: SchedulerGuard::blocking_timed_wait
    pub fn signal(&mut self) {
        self.state.signal_count += 1;
        let waiting = mem::take(&mut self.state.waiting);
        let released: Vec<Alarm> =
            waiting.into_iter().filter_map(|key| self.state.outstanding.remove(&key)).collect();
        debug!("signal {} releases {} waiters", self.state.signal_count, released.len());
        self.scheduler.condvar.notify_all();
        MutexGuard::unlocked(&mut self.state, || {
            for alarm in released {
                alarm.cancel();
            }
        });
        self.run_alarms();
    }

    fn insert(&mut self, wakeup_us: i64, alarm: Alarm) -> AlarmKey {
        let key = AlarmKey { wakeup_us, index: self.state.next_index };
        self.state.next_index += 1;
        let earlier = self.state.outstanding.keys().next().map_or(false, |first| key < *first);
        self.state.outstanding.insert(key, alarm);
        if earlier {
            self.scheduler.condvar.notify_all();
        }
        key
    }

    fn run_due_alarms(&mut self, ran: &mut bool) -> Option<i64> {
        loop {
            let now_us = self.now_us();
            let entry = self.state.outstanding.first_entry()?;
            if entry.key().wakeup_us > now_us {
                return Some(entry.key().wakeup_us);
            }
            // Removal under the mutex decides ownership: a concurrent cancel
            // will no longer find this alarm.
            let (key, alarm) = entry.remove_entry();
            self.state.waiting.remove(&key);
            *ran = true;
            trace!("running alarm {key:?}");
            MutexGuard::unlocked(&mut self.state, || alarm.run());
        }
    }

    fn await_wakeup(&mut self, wakeup_us: i64) {
        let now_us = self.now_us();
        if wakeup_us <= now_us || self.scheduler.clock.advance_to_us(wakeup_us) {
            return;
        }
        // Round up so the wait never ends before the deadline.
        let interval_ms = (wakeup_us - now_us + MS_US - 1) / MS_US;
        let timeout = Duration::from_millis(u64::try_from(interval_ms).unwrap_or(0));
        self.scheduler.condvar.wait_for(&mut self.state, timeout);
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::Scheduler;
    use crate::action::action;
    use crate::clock::{Clock, MockClock, MS_US};
    use crate::test::Log;

    fn mock_scheduler() -> (Arc<MockClock>, Scheduler) {
        let clock = Arc::new(MockClock::new(0));
        let scheduler = Scheduler::new(clock.clone());
        (clock, scheduler)
    }

    #[test]
    fn alarms_fire_in_time_order() {
        let (clock, scheduler) = mock_scheduler();
        let log = Log::new();
        scheduler.add_alarm_at_us(3 * MS_US, log.action("c"));
        scheduler.add_alarm_at_us(MS_US, log.action("a"));
        scheduler.add_alarm_at_us(2 * MS_US, log.action("b"));
        clock.set_time_ms(3);
        assert_eq!(scheduler.lock().run_alarms(), None);
        assert_eq!(log.take(), "a(grant) b(grant) c(grant) ");
    }

    #[test]
    fn equal_deadlines_fire_in_insertion_order() {
        let (clock, scheduler) = mock_scheduler();
        let log = Log::new();
        for name in ["a", "b", "c", "d"] {
            scheduler.add_alarm_at_us(MS_US, log.action(name));
        }
        clock.set_time_ms(1);
        scheduler.lock().run_alarms();
        assert_eq!(log.take(), "a(grant) b(grant) c(grant) d(grant) ");
    }

    #[test]
    fn past_deadline_runs_immediately() {
        let (clock, scheduler) = mock_scheduler();
        clock.set_time_ms(10);
        let log = Log::new();
        let id = scheduler.add_alarm_at_us(0, log.action("a"));
        assert_eq!(log.take(), "a(grant) ");
        assert!(!scheduler.cancel_alarm(id));
    }

    #[test]
    fn cancel_runs_cancel_path_once() {
        let (clock, scheduler) = mock_scheduler();
        let log = Log::new();
        let id = scheduler.add_alarm_at_us(MS_US, log.action("a"));
        assert!(scheduler.cancel_alarm(id));
        assert!(!scheduler.cancel_alarm(id));
        clock.set_time_ms(5);
        scheduler.lock().run_alarms();
        assert_eq!(log.take(), "a(deny) ");
    }

    #[test]
    fn process_alarms_advances_mock_time() {
        let (clock, scheduler) = mock_scheduler();
        let log = Log::new();
        scheduler.add_alarm_at_us(40 * MS_US, log.action("a"));
        assert!(!scheduler.process_alarms(10 * MS_US));
        assert_eq!(clock.now_ms(), 10);
        assert!(scheduler.process_alarms(100 * MS_US));
        assert_eq!(clock.now_ms(), 40);
        assert_eq!(log.take(), "a(grant) ");
        assert!(!scheduler.process_alarms(0));
    }

    #[test]
    fn blocking_timed_wait_times_out() {
        let (clock, scheduler) = mock_scheduler();
        let mut guard = scheduler.lock();
        guard.blocking_timed_wait(10);
        assert_eq!(clock.now_ms(), 10);
        assert_eq!(guard.next_wakeup_us(), None);
    }

    #[test]
    fn blocking_timed_wait_runs_earlier_alarms() {
        let (clock, scheduler) = mock_scheduler();
        let log = Log::new();
        scheduler.add_alarm_at_us(4 * MS_US, log.action("a"));
        scheduler.lock().blocking_timed_wait(10);
        assert_eq!(log.take(), "a(grant) ");
        assert_eq!(clock.now_ms(), 10);
    }

    #[test]
    fn alarm_callback_may_reenter() {
        let (clock, scheduler) = mock_scheduler();
        let scheduler = Arc::new(scheduler);
        let log = Log::new();
        let inner = log.action("inner");
        let reentrant = Arc::clone(&scheduler);
        let outer = action(
            move || {
                reentrant.add_alarm_at_us(2 * MS_US, inner);
            },
            || {},
        );
        scheduler.add_alarm_at_us(MS_US, outer);
        clock.set_time_ms(2);
        scheduler.lock().run_alarms();
        assert_eq!(log.take(), "inner(grant) ");
    }

    #[test]
    fn signal_releases_timed_waiters() {
        let (clock, scheduler) = mock_scheduler();
        let fired = Arc::new(Mutex::new(Vec::new()));
        let mut guard = scheduler.lock();
        for id in 0..2 {
            let fired = Arc::clone(&fired);
            guard.timed_wait(1_000_000, move || fired.lock().push(id));
        }
        clock.set_time_ms(5);
        guard.signal();
        assert_eq!(*fired.lock(), [0, 1]);
        assert_eq!(guard.signal_count(), 1);
        assert_eq!(guard.next_wakeup_us(), None);
        clock.set_time_ms(2_000_000);
        guard.run_alarms();
        assert_eq!(fired.lock().len(), 2);
    }

    #[test]
    fn signal_leaves_plain_alarms_alone() {
        let (_clock, scheduler) = mock_scheduler();
        let log = Log::new();
        scheduler.add_alarm_at_us(MS_US, log.action("a"));
        scheduler.signal();
        assert_eq!(log.take(), "");
        assert_eq!(scheduler.lock().next_wakeup_us(), Some(MS_US));
    }

    #[test]
    fn drop_cancels_outstanding_alarms() {
        let (_clock, scheduler) = mock_scheduler();
        let log = Log::new();
        scheduler.add_alarm_at_us(MS_US, log.action("a"));
        scheduler.add_alarm_at_us(2 * MS_US, log.action("b"));
        drop(scheduler);
        assert_eq!(log.take(), "a(deny) b(deny) ");
    }
}
