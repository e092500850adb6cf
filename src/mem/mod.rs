//! In-memory named locks with timed waits and lock stealing.
//!
//! A [`MemLockManager`] hands out [`MemLock`] handles. Handles with the same
//! name contend for one lock, arbitrated by a per-name state that keeps the
//! current owner and the queue of pending requests. Pending requests are
//! served in order of their next deadline, ties broken by name and then by
//! handle creation order.
//!
//! A pending request leaves the queue in one of three ways:
//!
//! - the owner unlocks and the request is first in line, so it is granted;
//! - its wait expires, so it is cancelled;
//! - it is allowed to steal and the owner has held the lock for longer than
//!   its `steal_ms`, so ownership is transferred to it.
//!
//! Only the most impatient stealer of a name has its steal deadline armed.
//! The others wait for their turn at the front of the steal queue.
//!
//! The manager never looks at a clock on its own: deadlines are processed
//! when a handle is used, or when the owner of the manager calls
//! [`MemLockManager::wakeup`], typically from an alarm set at
//! [`MemLockManager::next_wakeup_time_ms`]. See [`ScheduledLockManager`] for a
//! manager that does this on a [`Scheduler`].
//!
//! Callbacks never run with the internal mutex held, so they may freely call
//! back into any handle.
//!
//! [`ScheduledLockManager`]: crate::scheduled::ScheduledLockManager
//! [`Scheduler`]: crate::scheduler::Scheduler
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use namedlock::clock::MockClock;
//! use namedlock::lock::NamedLock;
//! use namedlock::mem::MemLockManager;
//!
//! let clock = Arc::new(MockClock::new(0));
//! let manager = MemLockManager::new(clock.clone());
//! let first = manager.create_named_lock("page");
//! let second = manager.create_named_lock("page");
//!
//! assert!(first.try_lock());
//! assert!(!second.try_lock());
//! drop(first);
//! assert!(second.try_lock());
//! ```

use core::mem;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use log::{debug, error};
use parking_lot::Mutex;

use crate::action::Delivery;
use crate::clock::Clock;
use crate::lock::{NamedLock, NamedLockManager};

mod lock;
mod state;

pub use lock::MemLock;

use state::{MemLockState, WakeupKey};

/// Everything a manager and its handles share.
pub(crate) struct Shared {
    core: Mutex<Core>,
    clock: Arc<dyn Clock>,
}

impl Shared {
    /// Runs `f` with the core locked, then delivers the callbacks it queued
    /// once the lock is released.
    pub(crate) fn run<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut Core, i64) -> R,
    {
        let (result, deliveries) = {
            let mut core = self.core.lock();
            // Never let the manager's notion of time move backwards.
            let now_ms = self.clock.now_ms().max(core.latest_ms);
            core.latest_ms = now_ms;
            let result = f(&mut core, now_ms);
            (result, mem::take(&mut core.deliveries))
        };
        for delivery in deliveries {
            delivery.deliver();
        }
        result
    }
}

#[derive(Debug)]
pub(crate) struct Core {
    attached: bool,
    latest_ms: i64,
    next_sequence: i64,
    states: HashMap<Arc<str>, MemLockState>,
    // Every pending waiter of every name, earliest deadline first.
    index: BTreeSet<WakeupKey>,
    deliveries: Vec<Delivery>,
}

impl Core {
    fn new() -> Self {
        Self {
            attached: true,
            latest_ms: i64::MIN,
            next_sequence: 0,
            states: HashMap::new(),
            index: BTreeSet::new(),
            deliveries: Vec::new(),
        }
    }

    /// Runs `f` against the state of `name`, if it exists.
    fn with_state<F, R>(&mut self, name: &str, now_ms: i64, f: F) -> Option<R>
    where
        F: FnOnce(&mut MemLockState, &mut Context<'_>) -> R,
    {
        let Self { states, index, deliveries, .. } = self;
        let state = states.get_mut(name)?;
        let mut cx = Context { now_ms, index, deliveries };
        Some(f(state, &mut cx))
    }

    /// Processes every pending waiter whose deadline is not in the future.
    fn wakeup(&mut self, now_ms: i64) {
        while let Some(key) = self.index.first().cloned() {
            if key.wakeup_time_ms > now_ms {
                break;
            }
            let found =
                self.with_state(&key.name, now_ms, |state, cx| state.wakeup_lock(key.sequence, cx));
            if found.is_none() || self.index.first() == Some(&key) {
                debug_assert!(false, "waiter {key:?} made no progress");
                error!("dropping stuck waiter #{} on `{}`", key.sequence, key.name);
                self.index.remove(&key);
            }
        }
    }

    fn next_wakeup_time_ms(&self) -> Option<i64> {
        self.index.first().map(|key| key.wakeup_time_ms)
    }

    fn detach(&mut self, now_ms: i64) {
        self.attached = false;
        let Self { states, index, deliveries, .. } = self;
        for state in states.values_mut() {
            let mut cx = Context { now_ms, index: &mut *index, deliveries: &mut *deliveries };
            state.deny_all(&mut cx);
        }
        index.clear();
        debug!(
            "lock manager detached from {} names, {} callbacks cancelled",
            states.len(),
            deliveries.len()
        );
    }
}

/// The slice of the core a [`MemLockState`] may touch besides itself.
pub(crate) struct Context<'a> {
    pub now_ms: i64,
    index: &'a mut BTreeSet<WakeupKey>,
    deliveries: &'a mut Vec<Delivery>,
}

impl Context<'_> {
    pub fn add_pending_lock(&mut self, key: WakeupKey) {
        self.index.insert(key);
    }

    pub fn remove_pending_lock(&mut self, key: &WakeupKey) {
        self.index.remove(key);
    }

    /// Queues a callback to run once the core is unlocked.
    pub fn deliver(&mut self, delivery: Delivery) {
        self.deliveries.push(delivery);
    }
}

/// Creates [`MemLock`] handles and tracks the deadlines of their requests.
///
/// Dropping the manager cancels every pending request. Handles that outlive it
/// can still unlock, but any new request is cancelled right away.
pub struct MemLockManager {
    shared: Arc<Shared>,
}

impl MemLockManager {
    /// Creates a manager reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { shared: Arc::new(Shared { core: Mutex::new(Core::new()), clock }) }
    }

    /// Creates a new handle on the lock called `name`.
    pub fn create_named_lock(&self, name: &str) -> MemLock {
        self.shared.run(|core, _| {
            core.next_sequence += 1;
            let sequence = core.next_sequence;
            let name = match core.states.get_key_value(name) {
                Some((key, _)) => Arc::clone(key),
                None => {
                    let key: Arc<str> = Arc::from(name);
                    core.states.insert(Arc::clone(&key), MemLockState::new(Arc::clone(&key)));
                    key
                }
            };
            if let Some(state) = core.states.get_mut(&name) {
                state.create_lock(sequence);
            }
            MemLock::new(Arc::clone(&self.shared), name, sequence)
        })
    }

    /// The earliest deadline among all pending requests.
    pub fn next_wakeup_time_ms(&self) -> Option<i64> {
        self.shared.core.lock().next_wakeup_time_ms()
    }

    /// Grants, steals or cancels every pending request whose deadline has
    /// passed.
    pub fn wakeup(&self) {
        self.shared.run(|core, now_ms| core.wakeup(now_ms));
    }

    /// Number of names with at least one live handle.
    pub fn name_count(&self) -> usize {
        self.shared.core.lock().states.len()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.shared.clock
    }
}

impl NamedLockManager for MemLockManager {
    fn create_named_lock(&self, name: &str) -> Box<dyn NamedLock> {
        Box::new(MemLockManager::create_named_lock(self, name))
    }
}

impl Drop for MemLockManager {
    fn drop(&mut self) {
        self.shared.run(|core, now_ms| core.detach(now_ms));
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use core::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    use super::MemLockManager;
    use crate::clock::{Clock, MockClock, MS_US};
    use crate::lock::{NamedLock, NamedLockManager};
    use crate::test::{self, tests, Harness, Log};

    const STEAL_MS: i64 = 50_000;
    const WAIT_MS: i64 = 10_000;

    /// A clock that goes wherever it is told, backwards included.
    #[derive(Default)]
    struct SteppingClock(AtomicI64);

    impl SteppingClock {
        fn set_ms(&self, time_ms: i64) {
            self.0.store(time_ms * MS_US, Ordering::Release);
        }
    }

    impl Clock for SteppingClock {
        fn now_us(&self) -> i64 {
            self.0.load(Ordering::Acquire)
        }
    }

    struct MemHarness {
        clock: Arc<MockClock>,
        manager: MemLockManager,
    }

    impl Harness for MemHarness {
        fn new(clock: Arc<MockClock>) -> Self {
            let manager = MemLockManager::new(clock.clone());
            Self { clock, manager }
        }

        fn manager(&self) -> &dyn NamedLockManager {
            &self.manager
        }

        fn quiesce(&self) {
            while let Some(wakeup_ms) = self.manager.next_wakeup_time_ms() {
                self.clock.set_time_ms(wakeup_ms);
                self.manager.wakeup();
            }
        }
    }

    fn setup() -> (Arc<MockClock>, MemLockManager, Log) {
        test::init_logger();
        let clock = Arc::new(MockClock::new(0));
        let manager = MemLockManager::new(clock.clone());
        (clock, manager, Log::new())
    }

    fn quiesce(clock: &MockClock, manager: &MemLockManager) {
        while let Some(wakeup_ms) = manager.next_wakeup_time_ms() {
            clock.set_time_ms(wakeup_ms);
            manager.wakeup();
        }
    }

    #[test]
    fn lock_unlock() {
        tests::lock_unlock::<MemHarness>();
    }

    #[test]
    fn double_lock_unlock() {
        tests::double_lock_unlock::<MemHarness>();
    }

    #[test]
    fn unlock_on_drop() {
        tests::unlock_on_drop::<MemHarness>();
    }

    #[test]
    fn lock_independence() {
        tests::lock_independence::<MemHarness>();
    }

    #[test]
    fn timeout_expires() {
        tests::timeout_expires::<MemHarness>();
    }

    #[test]
    fn timeout_before_steal() {
        tests::timeout_before_steal::<MemHarness>();
    }

    #[test]
    fn steal_before_timeout() {
        tests::steal_before_timeout::<MemHarness>();
    }

    #[test]
    fn wait_for_release() {
        tests::wait_for_release::<MemHarness>();
    }

    #[test]
    fn last_handle_removes_name() {
        let (_clock, manager, _log) = setup();
        let a = manager.create_named_lock("k");
        let b = manager.create_named_lock("k");
        assert_eq!(manager.name_count(), 1);
        a.lock_timed_wait(0, Log::new().action("a"));
        drop(a);
        assert_eq!(manager.name_count(), 1);
        drop(b);
        assert_eq!(manager.name_count(), 0);
    }

    #[test]
    fn sequences_increase() {
        let (_clock, manager, _log) = setup();
        let a = manager.create_named_lock("x");
        let b = manager.create_named_lock("y");
        assert!(a.sequence() < b.sequence());
    }

    #[test]
    fn multiple_locks_same_timeouts() {
        let (clock, manager, log) = setup();
        let a = manager.create_named_lock("lock1");
        let b = manager.create_named_lock("lock1");
        let c = manager.create_named_lock("lock1");
        let d = manager.create_named_lock("lock2");
        let e = manager.create_named_lock("lock2");
        a.lock_timed_wait_steal_old(WAIT_MS, STEAL_MS, log.action("a"));
        b.lock_timed_wait_steal_old(WAIT_MS, STEAL_MS, log.action("b"));
        c.lock_timed_wait_steal_old(WAIT_MS, STEAL_MS, log.action("c"));
        d.lock_timed_wait_steal_old(WAIT_MS, STEAL_MS, log.action("d"));
        e.lock_timed_wait_steal_old(WAIT_MS, STEAL_MS, log.action("e"));
        quiesce(&clock, &manager);
        // Waits expire long before anyone may steal.
        assert_eq!(log.take(), "a(grant) d(grant) b(deny) c(deny) e(deny) ");
        assert_eq!(clock.now_ms(), WAIT_MS);

        // Close enough to the steal deadline of `a` that `b` steals, while
        // `c` queues behind `b` and times out.
        clock.set_time_ms(STEAL_MS - WAIT_MS / 2);
        b.lock_timed_wait_steal_old(WAIT_MS, STEAL_MS, log.action("b"));
        c.lock_timed_wait_steal_old(WAIT_MS, STEAL_MS, log.action("c"));
        assert_eq!(manager.next_wakeup_time_ms(), Some(STEAL_MS));
        quiesce(&clock, &manager);
        assert_eq!(log.take(), "b(grant) c(deny) ");
        assert!(b.held());
        assert!(!a.held());
    }

    #[test]
    fn override_steal() {
        let (clock, manager, log) = setup();
        let a = manager.create_named_lock("lock1");
        let b = manager.create_named_lock("lock1");
        let c = manager.create_named_lock("lock1");
        a.lock_timed_wait_steal_old(WAIT_MS, STEAL_MS, log.action("a"));
        clock.set_time_ms(STEAL_MS - WAIT_MS / 2);
        b.lock_timed_wait_steal_old(WAIT_MS, STEAL_MS, log.action("b"));
        // One millisecond less patient than `b`, so `c` steals first.
        c.lock_timed_wait_steal_old(WAIT_MS, STEAL_MS - 1, log.action("c"));
        assert_eq!(manager.next_wakeup_time_ms(), Some(STEAL_MS - 1));
        quiesce(&clock, &manager);
        assert_eq!(log.take(), "a(grant) c(grant) b(deny) ");
    }

    #[test]
    fn unlock_revealing_new_stealer() {
        let (clock, manager, log) = setup();
        let a = manager.create_named_lock("lock1");
        let b = manager.create_named_lock("lock1");
        let c = manager.create_named_lock("lock1");
        a.lock_timed_wait_steal_old(WAIT_MS, STEAL_MS, log.action("a"));
        b.lock_timed_wait_steal_old(WAIT_MS, STEAL_MS, log.action("b"));
        c.lock_timed_wait_steal_old(2 * STEAL_MS, STEAL_MS, log.action("c"));
        clock.set_time_ms(1);
        manager.wakeup();
        assert!(a.held());
        clock.set_time_ms(STEAL_MS - WAIT_MS / 2);
        // Grants `b`, which makes `c` the armed stealer against it.
        a.unlock();
        assert_eq!(manager.next_wakeup_time_ms(), Some(2 * STEAL_MS - WAIT_MS / 2));
        quiesce(&clock, &manager);
        assert_eq!(log.take(), "a(grant) b(grant) c(grant) ");
        assert!(c.held());
    }

    #[test]
    fn steal_old() {
        let (clock, manager, _log) = setup();
        let lock1 = manager.create_named_lock("lock1");
        let lock1a = manager.create_named_lock("lock1");
        let lock1b = manager.create_named_lock("lock1");
        let lock1c = manager.create_named_lock("lock1");
        assert!(lock1.try_lock());
        assert!(!lock1a.try_lock_steal_old(STEAL_MS));
        clock.advance_ms(STEAL_MS);
        assert!(!lock1a.try_lock_steal_old(STEAL_MS));
        assert!(lock1.held());
        clock.advance_ms(1);
        assert!(lock1a.try_lock_steal_old(STEAL_MS));
        assert!(!lock1.held());
        // The steal restarts the clock for the next stealer.
        assert!(!lock1b.try_lock_steal_old(STEAL_MS));
        clock.advance_ms(STEAL_MS);
        assert!(!lock1b.try_lock_steal_old(STEAL_MS));
        assert!(lock1a.held());
        assert!(!lock1b.held());
        clock.advance_ms(1);
        assert!(lock1c.try_lock_steal_old(STEAL_MS));
        assert!(!lock1b.held());
        assert!(lock1c.held());
    }

    #[test]
    fn blocking_steal_old() {
        let (clock, manager, _log) = setup();
        let harness = MemHarness { clock: Arc::clone(&clock), manager };
        let lock1 = harness.manager.create_named_lock("lock1");
        let lock1a = harness.manager.create_named_lock("lock1");
        let lock1b = harness.manager.create_named_lock("lock1");
        let lock1c = harness.manager.create_named_lock("lock1");
        assert!(lock1.try_lock());
        let start_ms = clock.now_ms();
        assert!(test::lock_timed_wait_steal_old(&harness, &lock1a, STEAL_MS * 100, STEAL_MS));
        assert_eq!(clock.now_ms(), start_ms + STEAL_MS);
        assert!(!lock1b.try_lock_steal_old(STEAL_MS));
        clock.advance_ms(STEAL_MS);
        assert!(!lock1b.try_lock_steal_old(STEAL_MS));
        clock.advance_ms(1);
        assert!(lock1c.try_lock_steal_old(STEAL_MS));
    }

    #[test]
    fn wait_steal_old() {
        let (clock, manager, _log) = setup();
        let harness = MemHarness { clock: Arc::clone(&clock), manager };
        let lock1 = harness.manager.create_named_lock("lock1");
        let lock1a = harness.manager.create_named_lock("lock1");
        assert!(lock1.try_lock());
        let start_ms = clock.now_ms();
        assert!(!test::lock_timed_wait_steal_old(&harness, &lock1a, WAIT_MS, STEAL_MS));
        let end_ms = clock.now_ms();
        assert!(start_ms + WAIT_MS <= end_ms);
        assert!(start_ms + STEAL_MS > end_ms);
        // Now the steal deadline falls within the wait.
        clock.set_time_ms(start_ms + STEAL_MS - WAIT_MS / 2);
        let start_ms = clock.now_ms();
        assert!(test::lock_timed_wait_steal_old(&harness, &lock1a, WAIT_MS, STEAL_MS));
        assert!(start_ms + WAIT_MS > clock.now_ms());
    }

    #[test]
    fn unlock_by_drop_grants_waiter() {
        let (_clock, manager, log) = setup();
        let lock1 = manager.create_named_lock("lock1");
        let lock1a = manager.create_named_lock("lock1");
        assert!(lock1.try_lock());
        lock1a.lock_timed_wait(WAIT_MS, log.action("a"));
        drop(lock1);
        assert_eq!(log.take(), "a(grant) ");
        assert!(lock1a.held());
    }

    #[test]
    fn close_manager_with_active_locks() {
        let (_clock, manager, log) = setup();
        let a = manager.create_named_lock("lock1");
        let b = manager.create_named_lock("lock1");
        let c = manager.create_named_lock("lock1");
        a.lock_timed_wait(WAIT_MS, log.action("a"));
        b.lock_timed_wait(WAIT_MS, log.action("b"));
        c.lock_timed_wait(WAIT_MS, log.action("c"));
        drop(manager);
        assert_eq!(log.take(), "a(grant) b(deny) c(deny) ");
        assert!(a.held());
        a.unlock();
        assert!(!a.held());
        assert!(!b.held());
        b.lock_timed_wait(WAIT_MS, log.action("b"));
        assert_eq!(log.take(), "b(deny) ");
    }

    #[test]
    fn delete_pending_lock() {
        let (_clock, manager, log) = setup();
        let a = manager.create_named_lock("lock1");
        let b = manager.create_named_lock("lock1");
        let c = manager.create_named_lock("lock1");
        a.lock_timed_wait(WAIT_MS, log.action("a"));
        b.lock_timed_wait(WAIT_MS, log.action("b"));
        c.lock_timed_wait(WAIT_MS, log.action("c"));
        drop(b);
        a.unlock();
        assert_eq!(log.take(), "a(grant) b(deny) c(grant) ");
    }

    #[test]
    fn steal_needs_strictly_older_holder() {
        let (clock, manager, _log) = setup();
        let a = manager.create_named_lock("lock1");
        let b = manager.create_named_lock("lock1");
        assert!(a.try_lock());
        clock.set_time_ms(STEAL_MS);
        assert!(!b.try_lock_steal_old(STEAL_MS));
        clock.advance_ms(1);
        assert!(b.try_lock_steal_old(STEAL_MS));
        assert!(b.held());
        assert!(!a.held());
    }

    #[test]
    fn fifo_at_equal_deadlines() {
        let (clock, manager, log) = setup();
        let owner = manager.create_named_lock("b");
        assert!(owner.try_lock());
        let waiters: Vec<_> = (0..4).map(|_| manager.create_named_lock("b")).collect();
        for (i, waiter) in waiters.iter().enumerate() {
            waiter.lock_timed_wait(1_000, log.action(&i.to_string()));
        }
        owner.unlock();
        for (i, waiter) in waiters.iter().enumerate() {
            clock.advance_ms(1);
            assert!(waiter.held(), "waiter {i} not granted");
            waiter.unlock();
        }
        assert_eq!(log.take(), "0(grant) 1(grant) 2(grant) 3(grant) ");
    }

    #[test]
    fn most_impatient_stealer_wins() {
        let (clock, manager, log) = setup();
        let owner = manager.create_named_lock("s");
        assert!(owner.try_lock());
        let slow = manager.create_named_lock("s");
        let fast = manager.create_named_lock("s");
        let mid = manager.create_named_lock("s");
        slow.lock_timed_wait_steal_old(WAIT_MS, 3_000, log.action("slow"));
        fast.lock_timed_wait_steal_old(WAIT_MS, 1_000, log.action("fast"));
        mid.lock_timed_wait_steal_old(WAIT_MS, 2_000, log.action("mid"));
        clock.set_time_ms(1_000);
        manager.wakeup();
        assert_eq!(log.take(), "fast(grant) ");
        assert!(fast.held());
        // `mid` is now the armed stealer, measured from the steal at 1s.
        assert_eq!(manager.next_wakeup_time_ms(), Some(3_000));
    }

    #[test]
    fn callback_may_unlock_reentrantly() {
        let (_clock, manager, log) = setup();
        let a = Arc::new(manager.create_named_lock("r"));
        let b = manager.create_named_lock("r");
        assert!(a.try_lock());
        let holder = Arc::clone(&a);
        let inner = log.action("inner");
        b.lock_timed_wait(
            WAIT_MS,
            crate::action::action(
                move || {
                    holder.lock_timed_wait(WAIT_MS, inner);
                },
                || {},
            ),
        );
        a.unlock();
        assert!(b.held());
        b.unlock();
        assert!(a.held());
        assert_eq!(log.take(), "inner(grant) ");
    }

    #[test]
    fn clock_regression_keeps_later_time() {
        test::init_logger();
        let clock = Arc::new(SteppingClock::default());
        let manager = MemLockManager::new(clock.clone());
        let log = Log::new();
        let a = manager.create_named_lock("t");
        let b = manager.create_named_lock("t");
        let c = manager.create_named_lock("t");

        clock.set_ms(100);
        assert!(a.try_lock());
        clock.set_ms(40);
        b.lock_timed_wait(WAIT_MS, log.action("b"));
        a.unlock();
        assert_eq!(log.take(), "b(grant) ");

        // The grant is dated 100ms, so the steal is due at 150ms, not 90ms.
        c.lock_timed_wait_steal_old(WAIT_MS, 50, log.action("c"));
        assert_eq!(manager.next_wakeup_time_ms(), Some(150));
        clock.set_ms(90);
        manager.wakeup();
        assert_eq!(log.take(), "");
        assert!(b.held());
        clock.set_ms(150);
        manager.wakeup();
        assert_eq!(log.take(), "c(grant) ");
        assert!(c.held());
        assert!(!b.held());
    }
}
