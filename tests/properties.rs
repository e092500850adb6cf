use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use proptest::prelude::*;

use namedlock::action::action;
use namedlock::clock::MockClock;
use namedlock::lock::NamedLock;
use namedlock::mem::MemLockManager;
use namedlock::scheduler::Scheduler;

/// How often each side of an action ran.
#[derive(Debug, Default)]
struct Counts {
    run: AtomicUsize,
    cancel: AtomicUsize,
}

impl Counts {
    fn total(&self) -> usize {
        self.run.load(Ordering::Acquire) + self.cancel.load(Ordering::Acquire)
    }
}

fn counted(counts: &Arc<Counts>) -> namedlock::action::BoxAction {
    let (run, cancel) = (Arc::clone(counts), Arc::clone(counts));
    action(
        move || {
            run.run.fetch_add(1, Ordering::AcqRel);
        },
        move || {
            cancel.cancel.fetch_add(1, Ordering::AcqRel);
        },
    )
}

#[derive(Debug, Clone)]
enum WaitOp {
    Advance(i64),
    RunAlarms,
    Signal,
}

fn wait_op() -> impl Strategy<Value = WaitOp> {
    prop_oneof![
        3 => (0..8i64).prop_map(WaitOp::Advance),
        2 => Just(WaitOp::RunAlarms),
        1 => Just(WaitOp::Signal),
    ]
}

#[derive(Debug, Clone)]
enum LockOp {
    Advance(i64),
    Wakeup,
    Unlock,
    Relock,
    DropManager,
}

fn lock_op() -> impl Strategy<Value = LockOp> {
    prop_oneof![
        3 => (0..8i64).prop_map(LockOp::Advance),
        2 => Just(LockOp::Wakeup),
        2 => Just(LockOp::Unlock),
        1 => Just(LockOp::Relock),
        1 => Just(LockOp::DropManager),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Alarms fire in deadline order, and in insertion order on equal
    /// deadlines.
    #[test]
    fn alarms_fire_in_order(times in prop::collection::vec(0..50i64, 1..30)) {
        let clock = Arc::new(MockClock::new(0));
        let scheduler = Scheduler::new(clock.clone());
        let fired = Arc::new(Mutex::new(Vec::new()));
        let mut guard = scheduler.lock();
        for (index, &time_ms) in times.iter().enumerate() {
            let fired = Arc::clone(&fired);
            let fire = action(move || fired.lock().push((time_ms, index)), || {});
            guard.insert_alarm_at_us(time_ms * 1000, fire);
        }
        while let Some(wakeup_us) = guard.run_alarms() {
            clock.set_time_us(wakeup_us);
        }
        drop(guard);

        let mut expected: Vec<_> = times.iter().copied().zip(0..).collect();
        expected.sort();
        prop_assert_eq!(&*fired.lock(), &expected);
    }

    /// A timed wait answers exactly once however its timeout and a signal
    /// interleave, and nothing keeps its callback alive afterwards.
    #[test]
    fn timed_wait_answers_once(
        timeout_ms in 0..20i64,
        ops in prop::collection::vec(wait_op(), 0..20),
    ) {
        let clock = Arc::new(MockClock::new(0));
        let scheduler = Scheduler::new(clock.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = Arc::clone(&calls);
            scheduler.lock().timed_wait(timeout_ms, move || {
                calls.fetch_add(1, Ordering::AcqRel);
            });
        }
        for op in ops {
            match op {
                WaitOp::Advance(delta_ms) => clock.advance_ms(delta_ms),
                WaitOp::RunAlarms => {
                    scheduler.process_alarms(0);
                }
                WaitOp::Signal => scheduler.signal(),
            }
            prop_assert!(calls.load(Ordering::Acquire) <= 1);
        }
        drop(scheduler);
        prop_assert_eq!(calls.load(Ordering::Acquire), 1);
        prop_assert_eq!(Arc::strong_count(&calls), 1);
    }

    /// A lock request answers exactly once whether it is granted, expires,
    /// or loses its manager, in any interleaving.
    #[test]
    fn lock_request_answers_once(
        wait_ms in 0..20i64,
        ops in prop::collection::vec(lock_op(), 0..20),
    ) {
        let clock = Arc::new(MockClock::new(0));
        let manager = MemLockManager::new(clock.clone());
        let (holder, waiter) = (manager.create_named_lock("k"), manager.create_named_lock("k"));
        let mut manager = Some(manager);
        let counts = Arc::new(Counts::default());
        prop_assert!(holder.try_lock());
        waiter.lock_timed_wait(wait_ms, counted(&counts));
        for op in ops {
            match op {
                LockOp::Advance(delta_ms) => clock.advance_ms(delta_ms),
                LockOp::Wakeup => {
                    if let Some(manager) = &manager {
                        manager.wakeup();
                    }
                }
                LockOp::Unlock => holder.unlock(),
                LockOp::Relock => {
                    holder.try_lock();
                }
                LockOp::DropManager => manager = None,
            }
            prop_assert!(counts.total() <= 1);
            if waiter.held() {
                prop_assert!(!holder.held());
            }
        }
        drop(waiter);
        drop(holder);
        drop(manager);
        prop_assert_eq!(counts.total(), 1);
        prop_assert_eq!(Arc::strong_count(&counts), 1);
    }

    /// Waiters queued with the same deadline are granted in request order.
    #[test]
    fn equal_deadlines_grant_fifo(count in 1..8usize) {
        let clock = Arc::new(MockClock::new(0));
        let manager = MemLockManager::new(clock.clone());
        let owner = manager.create_named_lock("b");
        prop_assert!(owner.try_lock());
        let granted = Arc::new(Mutex::new(Vec::new()));
        let waiters: Vec<_> = (0..count).map(|_| manager.create_named_lock("b")).collect();
        for (index, waiter) in waiters.iter().enumerate() {
            let granted = Arc::clone(&granted);
            waiter.lock_timed_wait(1000, action(move || granted.lock().push(index), || {}));
        }
        owner.unlock();
        for waiter in &waiters {
            clock.advance_ms(1);
            waiter.unlock();
        }
        prop_assert_eq!(&*granted.lock(), &(0..count).collect::<Vec<_>>());
    }

    /// The most impatient stealer takes the lock from a stuck holder first,
    /// whatever order the stealers queued in.
    #[test]
    fn shortest_patience_steals_first(
        steals in prop::collection::btree_set(1..500i64, 2..6)
            .prop_map(|steals| steals.into_iter().collect::<Vec<_>>())
            .prop_shuffle()
    ) {
        let clock = Arc::new(MockClock::new(0));
        let manager = MemLockManager::new(clock.clone());
        let holder = manager.create_named_lock("s");
        prop_assert!(holder.try_lock());
        let granted = Arc::new(Mutex::new(Vec::new()));
        let stealers: Vec<_> = steals.iter().map(|_| manager.create_named_lock("s")).collect();
        for (stealer, &steal_ms) in stealers.iter().zip(&steals) {
            let granted = Arc::clone(&granted);
            let grant = action(move || granted.lock().push(steal_ms), || {});
            stealer.lock_timed_wait_steal_old(1000, steal_ms, grant);
        }
        let fastest = steals.iter().copied().min().unwrap_or_default();
        prop_assert_eq!(manager.next_wakeup_time_ms(), Some(fastest));
        clock.set_time_ms(fastest);
        manager.wakeup();
        prop_assert_eq!(&*granted.lock(), &[fastest]);
        prop_assert!(!holder.held());
    }
}
