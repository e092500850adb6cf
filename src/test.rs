use std::string::String;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::action::{action, action_once, BoxAction};
use crate::clock::MockClock;
use crate::lock::{NamedLock, NamedLockManager};

/// Installs a test logger, once per process.
pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).filter_level(log::LevelFilter::Debug).try_init();
}

/// Records the outcome of each action, in delivery order.
///
/// An action named `a` appends `a(grant) ` when run and `a(deny) ` when
/// cancelled.
#[derive(Clone, Debug, Default)]
pub struct Log(Arc<Mutex<String>>);

impl Log {
    pub fn new() -> Self {
        Self::default()
    }

    /// An action that records its outcome under `name`.
    pub fn action(&self, name: &str) -> BoxAction {
        let (granted, denied) = (self.clone(), self.clone());
        let (run_name, cancel_name) = (name.to_owned(), name.to_owned());
        action(move || granted.push(&run_name, "grant"), move || denied.push(&cancel_name, "deny"))
    }

    /// Returns everything recorded so far and clears the log.
    pub fn take(&self) -> String {
        core::mem::take(&mut *self.0.lock())
    }

    fn push(&self, name: &str, outcome: &str) {
        let mut log = self.0.lock();
        log.push_str(name);
        log.push('(');
        log.push_str(outcome);
        log.push_str(") ");
    }
}

/// Captures the outcome of a single request and checks it arrives once.
#[derive(Clone, Debug, Default)]
pub struct Outcome(Arc<Mutex<Option<bool>>>);

impl Outcome {
    pub fn action(&self) -> BoxAction {
        let slot = Arc::clone(&self.0);
        action_once(move |ok| {
            let prev = slot.lock().replace(ok);
            assert!(prev.is_none(), "outcome delivered twice");
        })
    }

    /// The delivered outcome, if any.
    pub fn get(&self) -> Option<bool> {
        *self.0.lock()
    }
}

/// A [`NamedLockManager`] together with whatever drives its deadlines.
pub trait Harness {
    /// Builds the manager under test on top of `clock`.
    fn new(clock: Arc<MockClock>) -> Self;

    fn manager(&self) -> &dyn NamedLockManager;

    /// Advances the mock clock through every outstanding deadline until no
    /// request is left waiting.
    fn quiesce(&self);
}

/// Requests `lock` with a timed wait and drives the harness until answered.
pub fn lock_timed_wait<H: Harness>(harness: &H, lock: &dyn NamedLock, wait_ms: i64) -> bool {
    let outcome = Outcome::default();
    lock.lock_timed_wait(wait_ms, outcome.action());
    harness.quiesce();
    outcome.get().unwrap_or_else(|| panic!("no outcome for {}", lock.name()))
}

/// Requests `lock` with a stealing timed wait and drives the harness until
/// answered.
pub fn lock_timed_wait_steal_old<H: Harness>(
    harness: &H,
    lock: &dyn NamedLock,
    wait_ms: i64,
    steal_ms: i64,
) -> bool {
    let outcome = Outcome::default();
    lock.lock_timed_wait_steal_old(wait_ms, steal_ms, outcome.action());
    harness.quiesce();
    outcome.get().unwrap_or_else(|| panic!("no outcome for {}", lock.name()))
}

/// Behaviour every [`NamedLockManager`] shares, run once per implementation.
pub mod tests {
    use std::sync::Arc;

    use super::{lock_timed_wait, lock_timed_wait_steal_old, Harness};
    use crate::clock::{Clock, MockClock};

    const SHORT_MS: i64 = 10;
    const LONG_MS: i64 = 100;

    fn harness<H: Harness>() -> (Arc<MockClock>, H) {
        super::init_logger();
        let clock = Arc::new(MockClock::new(0));
        let harness = H::new(Arc::clone(&clock));
        (clock, harness)
    }

    pub fn lock_unlock<H: Harness>() {
        let (_clock, harness) = harness::<H>();
        let lock1 = harness.manager().create_named_lock("lock");
        let lock2 = harness.manager().create_named_lock("lock");
        assert_eq!(lock1.name(), "lock");
        assert!(lock1.try_lock());
        assert!(lock1.held());
        assert!(!lock2.try_lock());
        assert!(!lock2.held());
        lock1.unlock();
        assert!(!lock1.held());
        assert!(lock2.try_lock());
        lock2.unlock();
    }

    pub fn double_lock_unlock<H: Harness>() {
        let (_clock, harness) = harness::<H>();
        let lock = harness.manager().create_named_lock("lock");
        assert!(lock.try_lock());
        lock.unlock();
        lock.unlock();
        assert!(lock.try_lock());
        lock.unlock();
    }

    pub fn unlock_on_drop<H: Harness>() {
        let (_clock, harness) = harness::<H>();
        let lock2 = harness.manager().create_named_lock("lock");
        {
            let lock1 = harness.manager().create_named_lock("lock");
            assert!(lock1.try_lock());
            assert!(!lock2.try_lock());
        }
        assert!(lock2.try_lock());
    }

    pub fn lock_independence<H: Harness>() {
        let (_clock, harness) = harness::<H>();
        let lock1 = harness.manager().create_named_lock("lock1");
        let lock2 = harness.manager().create_named_lock("lock2");
        assert!(lock1.try_lock());
        assert!(lock2.try_lock());
        lock1.unlock();
        lock2.unlock();
    }

    pub fn timeout_expires<H: Harness>() {
        let (clock, harness) = harness::<H>();
        let lock1 = harness.manager().create_named_lock("lock");
        let lock2 = harness.manager().create_named_lock("lock");
        assert!(lock1.try_lock());
        let start = clock.now_ms();
        assert!(!lock_timed_wait(&harness, &*lock2, SHORT_MS));
        let elapsed = clock.now_ms() - start;
        assert!((SHORT_MS..2 * SHORT_MS).contains(&elapsed), "elapsed {elapsed}");
        assert!(lock1.held());
    }

    pub fn timeout_before_steal<H: Harness>() {
        let (clock, harness) = harness::<H>();
        let lock1 = harness.manager().create_named_lock("lock");
        let lock2 = harness.manager().create_named_lock("lock");
        assert!(lock1.try_lock());
        let start = clock.now_ms();
        assert!(!lock_timed_wait_steal_old(&harness, &*lock2, SHORT_MS, LONG_MS));
        let elapsed = clock.now_ms() - start;
        assert!((SHORT_MS..2 * SHORT_MS).contains(&elapsed), "elapsed {elapsed}");
    }

    pub fn steal_before_timeout<H: Harness>() {
        let (clock, harness) = harness::<H>();
        let lock1 = harness.manager().create_named_lock("lock");
        let lock2 = harness.manager().create_named_lock("lock");
        assert!(lock1.try_lock());
        let start = clock.now_ms();
        assert!(lock_timed_wait_steal_old(&harness, &*lock2, LONG_MS, SHORT_MS));
        let elapsed = clock.now_ms() - start;
        assert!((SHORT_MS..2 * SHORT_MS).contains(&elapsed), "elapsed {elapsed}");
        assert!(lock2.held());
        lock2.unlock();
    }

    pub fn wait_for_release<H: Harness>() {
        let (_clock, harness) = harness::<H>();
        let lock1 = harness.manager().create_named_lock("lock");
        let lock2 = harness.manager().create_named_lock("lock");
        assert!(lock1.try_lock());
        let outcome = super::Outcome::default();
        lock2.lock_timed_wait(LONG_MS, outcome.action());
        assert_eq!(outcome.get(), None);
        lock1.unlock();
        harness.quiesce();
        assert_eq!(outcome.get(), Some(true));
        assert!(lock2.held());
    }
}
