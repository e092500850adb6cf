use std::sync::Arc;

use parking_lot::Mutex;

use namedlock::action::{action, action_once, BoxAction};
use namedlock::clock::{Clock, MockClock};
use namedlock::error::TryLockError;
use namedlock::lock::{NamedLock, TryLock};
use namedlock::mem::MemLockManager;
use namedlock::polling::PollingLock;
use namedlock::scheduled::ScheduledLockManager;
use namedlock::scheduler::Scheduler;

/// Outcomes in delivery order, as `name(grant)` or `name(deny)`.
#[derive(Clone, Default)]
struct Events(Arc<Mutex<Vec<String>>>);

impl Events {
    fn action(&self, name: &'static str) -> BoxAction {
        let (granted, denied) = (self.clone(), self.clone());
        action(
            move || granted.push(format!("{name}(grant)")),
            move || denied.push(format!("{name}(deny)")),
        )
    }

    fn push(&self, event: String) {
        self.0.lock().push(event);
    }

    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock())
    }
}

/// The time at which an action was answered, and how.
#[derive(Clone, Default)]
struct Answer(Arc<Mutex<Option<(bool, i64)>>>);

impl Answer {
    fn action(&self, clock: &Arc<MockClock>) -> BoxAction {
        let (answer, clock) = (Arc::clone(&self.0), Arc::clone(clock));
        action_once(move |ok| {
            let prev = answer.lock().replace((ok, clock.now_ms()));
            assert!(prev.is_none(), "answered twice");
        })
    }

    fn get(&self) -> Option<(bool, i64)> {
        *self.0.lock()
    }
}

struct NeverLock;

impl TryLock for NeverLock {
    fn try_lock(&self) -> Result<(), TryLockError> {
        Err(TryLockError::Held)
    }

    fn try_lock_steal_old(&self, _steal_ms: i64) -> Result<(), TryLockError> {
        Err(TryLockError::Held)
    }

    fn unlock(&self) {}

    fn held(&self) -> bool {
        false
    }

    fn name(&self) -> String {
        String::from("a")
    }
}

/// Busy until `free_at_ms`, then always available.
struct BusyUntil {
    clock: Arc<MockClock>,
    free_at_ms: i64,
}

impl TryLock for BusyUntil {
    fn try_lock(&self) -> Result<(), TryLockError> {
        if self.clock.now_ms() >= self.free_at_ms {
            Ok(())
        } else {
            Err(TryLockError::Held)
        }
    }

    fn try_lock_steal_old(&self, _steal_ms: i64) -> Result<(), TryLockError> {
        self.try_lock()
    }

    fn unlock(&self) {}

    fn held(&self) -> bool {
        false
    }

    fn name(&self) -> String {
        String::from("a")
    }
}

fn mock() -> (Arc<MockClock>, Arc<Scheduler>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let clock = Arc::new(MockClock::new(0));
    let scheduler = Arc::new(Scheduler::new(clock.clone()));
    (clock, scheduler)
}

/// Runs alarms, jumping the mock clock from deadline to deadline, until none
/// is left.
fn drain(clock: &MockClock, scheduler: &Scheduler) {
    let mut guard = scheduler.lock();
    while let Some(wakeup_us) = guard.run_alarms() {
        clock.set_time_us(wakeup_us);
    }
}

/// Runs every alarm due at or before `time_ms`.
fn run_until(clock: &MockClock, scheduler: &Scheduler, time_ms: i64) {
    clock.set_time_ms(time_ms);
    scheduler.process_alarms(0);
}

#[test]
fn simple_timeout() {
    let (clock, scheduler) = mock();
    let lock: PollingLock<_> = PollingLock::new(NeverLock, Arc::clone(&scheduler));
    let answer = Answer::default();
    lock.lock_timed_wait(10, answer.action(&clock));
    run_until(&clock, &scheduler, 9);
    assert_eq!(answer.get(), None);
    drain(&clock, &scheduler);
    let (granted, at_ms) = answer.get().unwrap();
    assert!(!granted);
    assert!((10..20).contains(&at_ms), "cancelled at {at_ms}");
}

#[test]
fn steal_after_timeout() {
    let (clock, scheduler) = mock();
    let manager = ScheduledLockManager::new(Arc::clone(&scheduler));
    let h1 = manager.create_named_lock("a");
    let h2 = manager.create_named_lock("a");
    let (a1, a2) = (Answer::default(), Answer::default());

    h1.lock_timed_wait_steal_old(100, 1000, a1.action(&clock));
    assert_eq!(a1.get(), Some((true, 0)));
    h2.lock_timed_wait_steal_old(1000, 10, a2.action(&clock));
    assert_eq!(manager.armed_wakeup_ms(), Some(10));

    run_until(&clock, &scheduler, 9);
    assert_eq!(a2.get(), None);
    assert!(h1.held());

    run_until(&clock, &scheduler, 10);
    assert_eq!(a2.get(), Some((true, 10)));
    assert!(!h1.held());
    h1.unlock();
    assert!(h2.held());
    h2.unlock();
    assert_eq!(manager.armed_wakeup_ms(), None);
}

#[test]
fn fifo_grants() {
    let (clock, scheduler) = mock();
    let manager = ScheduledLockManager::new(Arc::clone(&scheduler));
    let events = Events::default();
    let d = manager.create_named_lock("b");
    let waiters: Vec<_> = (0..3).map(|_| manager.create_named_lock("b")).collect();
    assert!(d.try_lock());
    for (waiter, name) in waiters.iter().zip(["A", "B", "C"]) {
        waiter.lock_timed_wait(1000, events.action(name));
    }

    run_until(&clock, &scheduler, 1);
    d.unlock();
    assert_eq!(events.take(), ["A(grant)"]);
    run_until(&clock, &scheduler, 2);
    waiters[0].unlock();
    assert_eq!(events.take(), ["B(grant)"]);
    run_until(&clock, &scheduler, 3);
    waiters[1].unlock();
    assert_eq!(events.take(), ["C(grant)"]);
    assert!(waiters[2].held());
}

#[test]
fn signal_collapses_waiters() {
    let (clock, scheduler) = mock();
    let events = Events::default();
    {
        let mut guard = scheduler.lock();
        for name in ["first", "second"] {
            let events = events.clone();
            guard.timed_wait(1_000_000, move || events.push(format!("{name}(grant)")));
        }
    }
    run_until(&clock, &scheduler, 5);
    assert!(events.take().is_empty());

    scheduler.signal();
    assert_eq!(events.take(), ["first(grant)", "second(grant)"]);
    let guard = scheduler.lock();
    assert_eq!(guard.signal_count(), 1);
    assert_eq!(guard.next_wakeup_us(), None);
}

#[test]
fn polling_back_off() {
    let (clock, scheduler) = mock();
    let backend = BusyUntil { clock: Arc::clone(&clock), free_at_ms: 80 };
    let lock: PollingLock<_> = PollingLock::new(backend, Arc::clone(&scheduler));
    let answer = Answer::default();
    lock.lock_timed_wait_steal_old(500, 100, answer.action(&clock));
    drain(&clock, &scheduler);
    let (granted, at_ms) = answer.get().unwrap();
    assert!(granted);
    assert!((80..=80 + 50).contains(&at_ms), "granted at {at_ms}");
}

#[test]
fn manager_drop_cancels_pending() {
    let (clock, _scheduler) = mock();
    let manager = MemLockManager::new(clock.clone());
    let holder = manager.create_named_lock("c");
    let waiter = manager.create_named_lock("c");
    let answer = Answer::default();
    assert!(holder.try_lock());
    waiter.lock_timed_wait(1000, answer.action(&clock));
    assert_eq!(answer.get(), None);

    drop(manager);
    assert_eq!(answer.get(), Some((false, 0)));
    let late = Answer::default();
    waiter.lock_timed_wait(1000, late.action(&clock));
    assert_eq!(late.get(), Some((false, 0)));
    holder.unlock();
    drop(waiter);
    drop(holder);
}

#[test]
fn scheduled_manager_drop_cancels_pending() {
    let (clock, scheduler) = mock();
    let manager = ScheduledLockManager::new(Arc::clone(&scheduler));
    let holder = manager.create_named_lock("c");
    let waiter = manager.create_named_lock("c");
    let answer = Answer::default();
    assert!(holder.try_lock());
    waiter.lock_timed_wait(1000, answer.action(&clock));

    drop(manager);
    assert_eq!(answer.get(), Some((false, 0)));
    assert_eq!(scheduler.lock().next_wakeup_us(), None);
    drop(waiter);
    holder.unlock();
}

#[test]
fn scheduler_drop_cancels_polling() {
    let (clock, scheduler) = mock();
    let lock: PollingLock<_> = PollingLock::new(NeverLock, Arc::clone(&scheduler));
    let answer = Answer::default();
    lock.lock_timed_wait(1000, answer.action(&clock));
    run_until(&clock, &scheduler, 5);
    assert_eq!(answer.get(), None);

    drop(lock);
    drop(scheduler);
    assert_eq!(answer.get(), Some((false, 5)));
}
