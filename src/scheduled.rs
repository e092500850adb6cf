//! A [`MemLockManager`] whose deadlines are driven by a [`Scheduler`].
//!
//! The in-memory manager only processes deadlines when asked to. The
//! [`ScheduledLockManager`] keeps exactly one scheduler alarm armed at the
//! manager's earliest deadline, and re-arms it after every operation that may
//! have moved that deadline. Whoever drives the scheduler, by processing
//! alarms or by blocking in a timed wait, thereby also expires and steals
//! locks.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicBool, Ordering};
//!
//! use namedlock::action::action_once;
//! use namedlock::clock::MockClock;
//! use namedlock::lock::NamedLock;
//! use namedlock::scheduled::ScheduledLockManager;
//! use namedlock::scheduler::Scheduler;
//!
//! let clock = Arc::new(MockClock::new(0));
//! let scheduler = Arc::new(Scheduler::new(clock.clone()));
//! let manager = ScheduledLockManager::new(Arc::clone(&scheduler));
//! let holder = manager.create_named_lock("a");
//! let waiter = manager.create_named_lock("a");
//! assert!(holder.try_lock());
//!
//! let denied = Arc::new(AtomicBool::new(false));
//! let flag = Arc::clone(&denied);
//! waiter.lock_timed_wait(10, action_once(move |ok| flag.store(!ok, Ordering::Release)));
//! scheduler.process_alarms(20_000);
//! assert!(denied.load(Ordering::Acquire));
//! ```

use core::fmt;
use std::sync::{Arc, Weak};

use log::trace;
use parking_lot::Mutex;

use crate::action::{action, BoxAction};
use crate::clock::MS_US;
use crate::lock::{NamedLock, NamedLockManager};
use crate::mem::{MemLock, MemLockManager};
use crate::scheduler::{AlarmId, Scheduler};

/// A thread safe named lock manager that processes its own deadlines on a
/// [`Scheduler`].
pub struct ScheduledLockManager {
    driver: Arc<Driver>,
    manager: Arc<MemLockManager>,
}

struct Driver {
    scheduler: Arc<Scheduler>,
    manager: Weak<MemLockManager>,
    alarm: Mutex<ArmedAlarm>,
}

#[derive(Debug, Default)]
struct ArmedAlarm {
    id: Option<AlarmId>,
    wakeup_ms: Option<i64>,
}

impl ScheduledLockManager {
    /// Creates a manager that arms its deadlines on `scheduler` and reads time
    /// from the scheduler clock.
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        let manager = Arc::new(MemLockManager::new(Arc::clone(scheduler.clock())));
        let driver = Driver {
            scheduler,
            manager: Arc::downgrade(&manager),
            alarm: Mutex::new(ArmedAlarm::default()),
        };
        Self { driver: Arc::new(driver), manager }
    }

    /// Creates a new handle on the lock called `name`.
    pub fn create_named_lock(&self, name: &str) -> ScheduledLock {
        let lock = self.manager.create_named_lock(name);
        ScheduledLock { lock, rearm: Rearm(Arc::clone(&self.driver)) }
    }

    /// The deadline the scheduler alarm is currently armed for.
    pub fn armed_wakeup_ms(&self) -> Option<i64> {
        self.driver.alarm.lock().wakeup_ms
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.driver.scheduler
    }
}

impl NamedLockManager for ScheduledLockManager {
    fn create_named_lock(&self, name: &str) -> Box<dyn NamedLock> {
        Box::new(ScheduledLockManager::create_named_lock(self, name))
    }
}

impl Drop for ScheduledLockManager {
    // Dropping the inner manager afterwards cancels every pending request.
    fn drop(&mut self) {
        self.driver.disarm();
    }
}

impl fmt::Debug for ScheduledLockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledLockManager")
            .field("alarm", &*self.driver.alarm.lock())
            .finish_non_exhaustive()
    }
}

impl Driver {
    fn manager(&self) -> Option<Arc<MemLockManager>> {
        self.manager.upgrade()
    }

    /// Moves the scheduler alarm to the manager's earliest deadline.
    fn update_alarm(self: &Arc<Self>) {
        // The manager must not drop while the scheduler mutex is held.
        let manager = self.manager();
        let mut scheduler = self.scheduler.lock();
        // Read under the scheduler mutex, so concurrent updates apply in order.
        let wakeup_ms = manager.as_ref().and_then(|manager| manager.next_wakeup_time_ms());
        let stale = {
            let mut armed = self.alarm.lock();
            if armed.wakeup_ms == wakeup_ms {
                return;
            }
            armed.wakeup_ms = wakeup_ms;
            armed.id.take()
        };
        if let Some(id) = stale {
            scheduler.cancel_alarm(id);
        }
        let Some(wakeup_ms) = wakeup_ms else {
            return;
        };
        trace!("lock manager alarm armed for {wakeup_ms}ms");
        let driver = Arc::downgrade(self);
        let action = wakeup_action(driver, wakeup_ms);
        let id = scheduler.insert_alarm_at_us(wakeup_ms.saturating_mul(MS_US), action);
        let mut armed = self.alarm.lock();
        if armed.wakeup_ms == Some(wakeup_ms) {
            armed.id = Some(id);
        }
    }

    /// Runs when the armed alarm fires.
    fn fire(self: &Arc<Self>, wakeup_ms: i64) {
        {
            let _scheduler = self.scheduler.lock();
            let mut armed = self.alarm.lock();
            if armed.wakeup_ms == Some(wakeup_ms) {
                *armed = ArmedAlarm::default();
            }
        }
        if let Some(manager) = self.manager() {
            manager.wakeup();
        }
        self.update_alarm();
    }

    fn disarm(&self) {
        let mut scheduler = self.scheduler.lock();
        let stale = core::mem::take(&mut *self.alarm.lock());
        if let Some(id) = stale.id {
            scheduler.cancel_alarm(id);
        }
    }
}

fn wakeup_action(driver: Weak<Driver>, wakeup_ms: i64) -> BoxAction {
    action(
        move || {
            if let Some(driver) = driver.upgrade() {
                driver.fire(wakeup_ms);
            }
        },
        || {},
    )
}

// Re-arms the scheduler alarm when dropped. Declared after the lock in
// `ScheduledLock` so it runs once the lock has been released.
struct Rearm(Arc<Driver>);

impl Drop for Rearm {
    fn drop(&mut self) {
        self.0.update_alarm();
    }
}

/// A handle on a named lock of a [`ScheduledLockManager`].
///
/// Every operation re-arms the scheduler alarm, so none of them may be called
/// by a thread that holds a [`SchedulerGuard`] of the same scheduler. Alarm
/// callbacks are fine: they run with the scheduler mutex released.
///
/// [`SchedulerGuard`]: crate::scheduler::SchedulerGuard
pub struct ScheduledLock {
    lock: MemLock,
    rearm: Rearm,
}

impl NamedLock for ScheduledLock {
    fn lock_timed_wait(&self, wait_ms: i64, action: BoxAction) {
        self.lock.lock_timed_wait(wait_ms, action);
        self.rearm.0.update_alarm();
    }

    fn lock_timed_wait_steal_old(&self, wait_ms: i64, steal_ms: i64, action: BoxAction) {
        self.lock.lock_timed_wait_steal_old(wait_ms, steal_ms, action);
        self.rearm.0.update_alarm();
    }

    fn unlock(&self) {
        self.lock.unlock();
        self.rearm.0.update_alarm();
    }

    fn held(&self) -> bool {
        self.lock.held()
    }

    fn name(&self) -> String {
        self.lock.name().to_owned()
    }
}

impl fmt::Debug for ScheduledLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledLock").field("lock", &self.lock).finish_non_exhaustive()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::Arc;

    use super::ScheduledLockManager;
    use crate::clock::{Clock, MockClock};
    use crate::lock::{NamedLock, NamedLockManager};
    use crate::scheduler::Scheduler;
    use crate::test::{self, tests, Harness, Log};

    const STEAL_MS: i64 = 50_000;
    const WAIT_MS: i64 = 10_000;

    struct ScheduledHarness {
        clock: Arc<MockClock>,
        scheduler: Arc<Scheduler>,
        manager: ScheduledLockManager,
    }

    impl Harness for ScheduledHarness {
        fn new(clock: Arc<MockClock>) -> Self {
            let scheduler = Arc::new(Scheduler::new(clock.clone()));
            let manager = ScheduledLockManager::new(Arc::clone(&scheduler));
            Self { clock, scheduler, manager }
        }

        fn manager(&self) -> &dyn NamedLockManager {
            &self.manager
        }

        fn quiesce(&self) {
            let mut scheduler = self.scheduler.lock();
            while let Some(wakeup_us) = scheduler.run_alarms() {
                self.clock.set_time_us(wakeup_us);
            }
        }
    }

    #[test]
    fn lock_unlock() {
        tests::lock_unlock::<ScheduledHarness>();
    }

    #[test]
    fn double_lock_unlock() {
        tests::double_lock_unlock::<ScheduledHarness>();
    }

    #[test]
    fn unlock_on_drop() {
        tests::unlock_on_drop::<ScheduledHarness>();
    }

    #[test]
    fn lock_independence() {
        tests::lock_independence::<ScheduledHarness>();
    }

    #[test]
    fn timeout_expires() {
        tests::timeout_expires::<ScheduledHarness>();
    }

    #[test]
    fn timeout_before_steal() {
        tests::timeout_before_steal::<ScheduledHarness>();
    }

    #[test]
    fn steal_before_timeout() {
        tests::steal_before_timeout::<ScheduledHarness>();
    }

    #[test]
    fn wait_for_release() {
        tests::wait_for_release::<ScheduledHarness>();
    }

    #[test]
    fn alarm_follows_earliest_deadline() {
        let harness = ScheduledHarness::new(Arc::new(MockClock::new(0)));
        let log = Log::new();
        let a = harness.manager.create_named_lock("lock1");
        let b = harness.manager.create_named_lock("lock1");
        let c = harness.manager.create_named_lock("lock1");
        assert!(a.try_lock());
        assert_eq!(harness.manager.armed_wakeup_ms(), None);
        b.lock_timed_wait(WAIT_MS, log.action("b"));
        assert_eq!(harness.manager.armed_wakeup_ms(), Some(WAIT_MS));
        c.lock_timed_wait_steal_old(2 * WAIT_MS, WAIT_MS / 2, log.action("c"));
        assert_eq!(harness.manager.armed_wakeup_ms(), Some(WAIT_MS / 2));
        harness.quiesce();
        assert_eq!(log.take(), "c(grant) b(deny) ");
        assert_eq!(harness.manager.armed_wakeup_ms(), None);
        assert_eq!(harness.clock.now_ms(), WAIT_MS);
    }

    #[test]
    fn dropping_holder_rearms_for_next_stealer() {
        let harness = ScheduledHarness::new(Arc::new(MockClock::new(0)));
        let log = Log::new();
        let a = harness.manager.create_named_lock("lock1");
        let b = harness.manager.create_named_lock("lock1");
        let c = harness.manager.create_named_lock("lock1");
        assert!(a.try_lock());
        b.lock_timed_wait_steal_old(4 * STEAL_MS, STEAL_MS, log.action("b"));
        c.lock_timed_wait_steal_old(4 * STEAL_MS, 2 * STEAL_MS, log.action("c"));
        assert_eq!(harness.manager.armed_wakeup_ms(), Some(STEAL_MS));
        harness.clock.set_time_ms(STEAL_MS / 2);
        drop(a);
        // `b` holds now, so `c` measures its patience from the release.
        assert_eq!(harness.manager.armed_wakeup_ms(), Some(STEAL_MS / 2 + 2 * STEAL_MS));
        harness.quiesce();
        assert_eq!(log.take(), "b(grant) c(grant) ");
    }

    #[test]
    fn unlock_with_dropped_manager() {
        let harness = ScheduledHarness::new(Arc::new(MockClock::new(0)));
        let lock = harness.manager.create_named_lock("lock1");
        assert!(lock.try_lock());
        let ScheduledHarness { manager, .. } = harness;
        drop(manager);
        assert!(lock.held());
        lock.unlock();
        assert!(!lock.held());
    }

    #[test]
    fn steal_with_dropped_manager() {
        let harness = ScheduledHarness::new(Arc::new(MockClock::new(0)));
        let lock = harness.manager.create_named_lock("lock1");
        let ScheduledHarness { manager, clock, .. } = harness;
        drop(manager);
        clock.advance_ms(STEAL_MS);
        assert!(!lock.try_lock_steal_old(STEAL_MS));
        assert!(!lock.try_lock());
    }

    #[test]
    fn drop_denies_pending_and_disarms() {
        let harness = ScheduledHarness::new(Arc::new(MockClock::new(0)));
        let log = Log::new();
        let a = harness.manager.create_named_lock("lock1");
        let b = harness.manager.create_named_lock("lock1");
        a.lock_timed_wait(WAIT_MS, log.action("a"));
        b.lock_timed_wait(WAIT_MS, log.action("b"));
        let ScheduledHarness { manager, scheduler, .. } = harness;
        drop(manager);
        assert_eq!(log.take(), "a(grant) b(deny) ");
        assert_eq!(scheduler.lock().next_wakeup_us(), None);
    }

    #[test]
    fn blocking_wait_drives_deadlines() {
        test::init_logger();
        let clock = Arc::new(MockClock::new(0));
        let scheduler = Arc::new(Scheduler::new(clock.clone()));
        let manager = ScheduledLockManager::new(Arc::clone(&scheduler));
        let log = Log::new();
        let a = manager.create_named_lock("lock1");
        let b = manager.create_named_lock("lock1");
        assert!(a.try_lock());
        b.lock_timed_wait_steal_old(STEAL_MS * 100, STEAL_MS, log.action("b"));
        scheduler.lock().blocking_timed_wait(2 * STEAL_MS);
        assert_eq!(log.take(), "b(grant) ");
        assert!(b.held());
        assert!(!a.held());
        assert!(clock.now_ms() >= STEAL_MS);
    }
}
