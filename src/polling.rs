//! Timed waits for locks that can only be tried.
//!
//! A [`PollingLock`] wraps a [`TryLock`] backend and offers the full
//! [`NamedLock`] contract on top of it. A request first tries the backend a
//! bounded number of times in a tight loop. If that fails, it re-tries from
//! scheduler alarms, backing off exponentially, until the backend gives in or
//! the wait expires.
//!
//! When stealing, the retry interval is capped at half the steal interval,
//! so the backend is polled at least twice per steal window.

use core::fmt;
use core::marker::PhantomData;
use std::sync::{Arc, Weak};

use log::{debug, trace};

use crate::action::{Action, BoxAction};
use crate::clock::MS_US;
use crate::lock::{NamedLock, TryLock};
use crate::relax::{Loop, Relax};
use crate::scheduler::Scheduler;

/// Tuning of the retry loop of a [`PollingLock`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollPolicy {
    /// Attempts made in a tight loop before falling back to alarms.
    pub spin_attempts: u32,
    /// First retry interval.
    pub min_interval_ms: i64,
    /// Largest retry interval when not stealing.
    pub max_interval_ms: i64,
    /// Fewest attempts made within one steal interval.
    pub min_tries_per_steal: i64,
}

impl PollPolicy {
    pub const fn new() -> Self {
        Self {
            spin_attempts: 100,
            min_interval_ms: 1,
            max_interval_ms: 60_000,
            min_tries_per_steal: 2,
        }
    }

    #[must_use]
    pub const fn with_spin_attempts(self, spin_attempts: u32) -> Self {
        Self { spin_attempts, ..self }
    }

    #[must_use]
    pub const fn with_min_interval_ms(self, min_interval_ms: i64) -> Self {
        Self { min_interval_ms, ..self }
    }

    #[must_use]
    pub const fn with_max_interval_ms(self, max_interval_ms: i64) -> Self {
        Self { max_interval_ms, ..self }
    }

    #[must_use]
    pub const fn with_min_tries_per_steal(self, min_tries_per_steal: i64) -> Self {
        Self { min_tries_per_steal, ..self }
    }

    /// The retry interval cap for a request stealing after `steal_ms`.
    pub fn max_interval_for(&self, steal_ms: Option<i64>) -> i64 {
        let cap = match steal_ms {
            Some(steal_ms) => {
                let per_try = steal_ms.saturating_add(1) / self.min_tries_per_steal.max(1);
                per_try.min(self.max_interval_ms)
            }
            None => self.max_interval_ms,
        };
        cap.max(self.min_interval_ms).max(1)
    }

    /// The retry interval following `interval_ms`, growing by about half.
    pub fn backoff(&self, interval_ms: i64, max_interval_ms: i64) -> i64 {
        max_interval_ms.min(1 + interval_ms + interval_ms / 2)
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::new()
    }
}

/// A [`NamedLock`] built by polling a [`TryLock`] backend on a [`Scheduler`].
///
/// The relax strategy `R` paces the initial tight loop.
///
/// Requests schedule alarms, so they must not be made by a thread that holds
/// a [`SchedulerGuard`] of the same scheduler.
///
/// [`SchedulerGuard`]: crate::scheduler::SchedulerGuard
///
/// # Example
///
/// ```
/// use std::sync::Arc;
///
/// use namedlock::clock::MockClock;
/// use namedlock::lock::NamedLock;
/// use namedlock::polling::PollingLock;
/// use namedlock::scheduler::Scheduler;
/// use namedlock::slot::{DefaultSlotTable, SlotLock};
///
/// let clock = Arc::new(MockClock::new(0));
/// let scheduler = Arc::new(Scheduler::new(clock.clone()));
/// let table = Arc::new(DefaultSlotTable::new(clock).unwrap());
///
/// let backend = SlotLock::new(Arc::clone(&table), "k");
/// let holder: PollingLock<_> = PollingLock::new(backend, Arc::clone(&scheduler));
/// let waiter: PollingLock<_> = PollingLock::new(SlotLock::new(table, "k"), scheduler);
/// assert!(holder.try_lock());
/// assert!(!waiter.lock_timed_wait_blocking(10));
/// holder.unlock();
/// assert!(waiter.lock_timed_wait_blocking(10));
/// ```
pub struct PollingLock<L, R = Loop> {
    poller: Arc<Poller<L, R>>,
    scheduler: Arc<Scheduler>,
}

// Pending retries sit in the scheduler and hold the poller, so the poller
// must not keep the scheduler alive.
struct Poller<L, R> {
    backend: L,
    scheduler: Weak<Scheduler>,
    policy: PollPolicy,
    relax: PhantomData<fn() -> R>,
}

impl<L, R> PollingLock<L, R>
where
    L: TryLock + 'static,
    R: Relax + 'static,
{
    /// Polls `backend` with the default [`PollPolicy`].
    pub fn new(backend: L, scheduler: Arc<Scheduler>) -> Self {
        Self::with_policy(backend, scheduler, PollPolicy::new())
    }

    pub fn with_policy(backend: L, scheduler: Arc<Scheduler>, policy: PollPolicy) -> Self {
        let poller = Poller {
            backend,
            scheduler: Arc::downgrade(&scheduler),
            policy,
            relax: PhantomData,
        };
        Self { poller: Arc::new(poller), scheduler }
    }

    pub fn backend(&self) -> &L {
        &self.poller.backend
    }

    /// Waits up to `wait_ms` for the lock, blocking the calling thread on the
    /// scheduler. Returns whether the lock was taken.
    pub fn lock_timed_wait_blocking(&self, wait_ms: i64) -> bool {
        self.poller.lock_blocking(&self.scheduler, wait_ms, None)
    }

    /// As [`lock_timed_wait_blocking`], stealing the lock from a holder older
    /// than `steal_ms`.
    ///
    /// [`lock_timed_wait_blocking`]: PollingLock::lock_timed_wait_blocking
    pub fn lock_timed_wait_steal_old_blocking(&self, wait_ms: i64, steal_ms: i64) -> bool {
        self.poller.lock_blocking(&self.scheduler, wait_ms, Some(steal_ms))
    }
}

impl<L, R> Poller<L, R>
where
    L: TryLock + 'static,
    R: Relax + 'static,
{
    fn attempt(&self, steal_ms: Option<i64>) -> bool {
        let result = match steal_ms {
            Some(steal_ms) => self.backend.try_lock_steal_old(steal_ms),
            None => self.backend.try_lock(),
        };
        match result {
            Ok(()) => true,
            Err(err) => {
                trace!("attempt on `{}` failed: {err}", self.backend.name());
                false
            }
        }
    }

    fn spin(&self, steal_ms: Option<i64>) -> bool {
        let mut relax = R::new();
        for _ in 0..self.policy.spin_attempts.max(1) {
            if self.attempt(steal_ms) {
                return true;
            }
            relax.relax();
        }
        false
    }

    fn lock(
        self: &Arc<Self>,
        scheduler: &Scheduler,
        wait_ms: i64,
        steal_ms: Option<i64>,
        action: BoxAction,
    ) {
        let start_ms = scheduler.clock().now_ms();
        if self.spin(steal_ms) {
            action.run();
            return;
        }
        let retry = Retry {
            poller: Arc::clone(self),
            steal_ms,
            end_ms: start_ms.saturating_add(wait_ms.max(0)),
            interval_ms: self.policy.min_interval_ms.max(1),
            max_interval_ms: self.policy.max_interval_for(steal_ms),
            action,
        };
        retry.schedule();
    }

    fn lock_blocking(&self, scheduler: &Scheduler, wait_ms: i64, steal_ms: Option<i64>) -> bool {
        let end_ms = scheduler.clock().now_ms().saturating_add(wait_ms.max(0));
        if self.spin(steal_ms) {
            return true;
        }
        let max_interval_ms = self.policy.max_interval_for(steal_ms);
        let mut interval_ms = self.policy.min_interval_ms.max(1);
        let mut scheduler = scheduler.lock();
        loop {
            let now_ms = scheduler.now_ms();
            if now_ms >= end_ms {
                debug!("blocking wait on `{}` timed out", self.backend.name());
                return false;
            }
            scheduler.blocking_timed_wait(interval_ms.min(end_ms - now_ms));
            if self.attempt(steal_ms) {
                return true;
            }
            interval_ms = self.policy.backoff(interval_ms, max_interval_ms);
        }
    }
}

/// A pending poll, parked on the scheduler between attempts.
struct Retry<L, R> {
    poller: Arc<Poller<L, R>>,
    steal_ms: Option<i64>,
    end_ms: i64,
    interval_ms: i64,
    max_interval_ms: i64,
    action: BoxAction,
}

impl<L, R> Retry<L, R>
where
    L: TryLock + 'static,
    R: Relax + 'static,
{
    fn schedule(self) {
        let scheduler = match self.poller.scheduler.upgrade() {
            Some(scheduler) => scheduler,
            None => {
                debug!("scheduler of `{}` is gone", self.poller.backend.name());
                self.action.cancel();
                return;
            }
        };
        let now_ms = scheduler.clock().now_ms();
        if now_ms >= self.end_ms {
            debug!("wait on `{}` timed out", self.poller.backend.name());
            self.action.cancel();
            return;
        }
        let wakeup_ms = now_ms.saturating_add(self.interval_ms).min(self.end_ms);
        scheduler.add_alarm_at_us(wakeup_ms.saturating_mul(MS_US), Box::new(self));
    }
}

impl<L, R> Action for Retry<L, R>
where
    L: TryLock + 'static,
    R: Relax + 'static,
{
    fn run(self: Box<Self>) {
        let mut retry = *self;
        if retry.poller.attempt(retry.steal_ms) {
            retry.action.run();
            return;
        }
        retry.interval_ms = retry.poller.policy.backoff(retry.interval_ms, retry.max_interval_ms);
        retry.schedule();
    }

    // The scheduler is shutting down.
    fn cancel(self: Box<Self>) {
        self.action.cancel();
    }
}

impl<L, R> NamedLock for PollingLock<L, R>
where
    L: TryLock + 'static,
    R: Relax + 'static,
{
    fn lock_timed_wait(&self, wait_ms: i64, action: BoxAction) {
        self.poller.lock(&self.scheduler, wait_ms, None, action);
    }

    fn lock_timed_wait_steal_old(&self, wait_ms: i64, steal_ms: i64, action: BoxAction) {
        self.poller.lock(&self.scheduler, wait_ms, Some(steal_ms), action);
    }

    fn unlock(&self) {
        self.poller.backend.unlock();
    }

    fn held(&self) -> bool {
        self.poller.backend.held()
    }

    fn name(&self) -> String {
        self.poller.backend.name()
    }

    fn try_lock(&self) -> bool {
        self.poller.attempt(None)
    }

    fn try_lock_steal_old(&self, steal_ms: i64) -> bool {
        self.poller.attempt(Some(steal_ms))
    }
}

impl<L: fmt::Debug, R> fmt::Debug for PollingLock<L, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollingLock")
            .field("backend", &self.poller.backend)
            .field("policy", &self.poller.policy)
            .finish_non_exhaustive()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::{PollPolicy, PollingLock};
    use crate::clock::{Clock, MockClock};
    use crate::error::TryLockError;
    use crate::lock::{NamedLock, TryLock};
    use crate::scheduler::Scheduler;
    use crate::test::{Log, Outcome};

    const SHORT_MS: i64 = 10;
    const LONG_MS: i64 = 100;

    /// Grants every attempt.
    struct AlwaysLock;

    /// Refuses every attempt.
    struct NeverLock;

    /// Only grants attempts that steal, once the previous hold is old enough.
    struct StealOnlyLock {
        clock: Arc<MockClock>,
        last_hold_ms: Mutex<i64>,
    }

    /// Busy until a fixed time, recording when it was tried.
    struct BusyUntil {
        clock: Arc<MockClock>,
        free_at_ms: i64,
        attempts: Mutex<Vec<i64>>,
    }

    macro_rules! unlockable {
        ($name:expr) => {
            fn unlock(&self) {}

            fn held(&self) -> bool {
                false
            }

            fn name(&self) -> String {
                String::from($name)
            }
        };
    }

    impl TryLock for AlwaysLock {
        fn try_lock(&self) -> Result<(), TryLockError> {
            Ok(())
        }

        fn try_lock_steal_old(&self, _steal_ms: i64) -> Result<(), TryLockError> {
            Ok(())
        }

        unlockable!("always");
    }

    impl TryLock for NeverLock {
        fn try_lock(&self) -> Result<(), TryLockError> {
            Err(TryLockError::Held)
        }

        fn try_lock_steal_old(&self, _steal_ms: i64) -> Result<(), TryLockError> {
            Err(TryLockError::Held)
        }

        unlockable!("never");
    }

    impl TryLock for StealOnlyLock {
        fn try_lock(&self) -> Result<(), TryLockError> {
            Err(TryLockError::Held)
        }

        fn try_lock_steal_old(&self, steal_ms: i64) -> Result<(), TryLockError> {
            let now_ms = self.clock.now_ms();
            let mut last_hold_ms = self.last_hold_ms.lock();
            if *last_hold_ms + steal_ms <= now_ms {
                *last_hold_ms = now_ms;
                Ok(())
            } else {
                Err(TryLockError::Held)
            }
        }

        unlockable!("steal-only");
    }

    impl TryLock for BusyUntil {
        fn try_lock(&self) -> Result<(), TryLockError> {
            let now_ms = self.clock.now_ms();
            self.attempts.lock().push(now_ms);
            if now_ms >= self.free_at_ms {
                Ok(())
            } else {
                Err(TryLockError::Held)
            }
        }

        fn try_lock_steal_old(&self, _steal_ms: i64) -> Result<(), TryLockError> {
            self.try_lock()
        }

        unlockable!("busy-until");
    }

    fn mock() -> (Arc<MockClock>, Arc<Scheduler>) {
        let clock = Arc::new(MockClock::new(0));
        let scheduler = Arc::new(Scheduler::new(clock.clone()));
        (clock, scheduler)
    }

    fn quiesce(clock: &MockClock, scheduler: &Scheduler) {
        let mut guard = scheduler.lock();
        while let Some(wakeup_us) = guard.run_alarms() {
            clock.set_time_us(wakeup_us);
        }
    }

    fn steal_only(
        clock: &Arc<MockClock>,
        scheduler: &Arc<Scheduler>,
    ) -> PollingLock<StealOnlyLock> {
        let backend = StealOnlyLock {
            clock: Arc::clone(clock),
            last_hold_ms: Mutex::new(clock.now_ms()),
        };
        PollingLock::new(backend, Arc::clone(scheduler))
    }

    #[test]
    fn policy_caps_interval_by_steal() {
        let policy = PollPolicy::default();
        assert_eq!(policy.max_interval_for(None), 60_000);
        assert_eq!(policy.max_interval_for(Some(100)), 50);
        assert_eq!(policy.max_interval_for(Some(0)), 1);
        let intervals: Vec<i64> =
            core::iter::successors(Some(1), |&i| Some(policy.backoff(i, 50))).take(10).collect();
        assert_eq!(intervals, [1, 2, 4, 7, 11, 17, 26, 40, 50, 50]);
    }

    #[test]
    fn always_lock_takes_no_time() {
        let (clock, scheduler) = mock();
        let lock: PollingLock<_> = PollingLock::new(AlwaysLock, scheduler);
        let start = clock.now_ms();
        assert!(lock.lock_timed_wait_blocking(LONG_MS));
        assert!(lock.lock_timed_wait_steal_old_blocking(LONG_MS, LONG_MS));
        let log = Log::new();
        lock.lock_timed_wait(LONG_MS, log.action("a"));
        lock.lock_timed_wait_steal_old(LONG_MS, LONG_MS, log.action("b"));
        assert_eq!(log.take(), "a(grant) b(grant) ");
        assert_eq!(clock.now_ms(), start);
    }

    #[test]
    fn timeout_happens() {
        let (clock, scheduler) = mock();
        let lock: PollingLock<_> = PollingLock::new(NeverLock, scheduler);
        assert!(!lock.lock_timed_wait_blocking(SHORT_MS));
        let elapsed = clock.now_ms();
        assert!((SHORT_MS..2 * SHORT_MS).contains(&elapsed), "elapsed {elapsed}");
    }

    #[test]
    fn callback_timeout_happens() {
        let (clock, scheduler) = mock();
        let lock: PollingLock<_> = PollingLock::new(NeverLock, Arc::clone(&scheduler));
        let outcome = Outcome::default();
        lock.lock_timed_wait(SHORT_MS, outcome.action());
        assert_eq!(outcome.get(), None);
        quiesce(&clock, &scheduler);
        assert_eq!(outcome.get(), Some(false));
        let elapsed = clock.now_ms();
        assert!((SHORT_MS..2 * SHORT_MS).contains(&elapsed), "elapsed {elapsed}");
    }

    #[test]
    fn timeout_happens_steal_old() {
        let (clock, scheduler) = mock();
        let lock: PollingLock<_> = PollingLock::new(NeverLock, Arc::clone(&scheduler));
        assert!(!lock.lock_timed_wait_steal_old_blocking(SHORT_MS, LONG_MS));
        let elapsed = clock.now_ms();
        assert!((SHORT_MS..2 * SHORT_MS).contains(&elapsed), "elapsed {elapsed}");

        let outcome = Outcome::default();
        lock.lock_timed_wait_steal_old(SHORT_MS, LONG_MS, outcome.action());
        quiesce(&clock, &scheduler);
        assert_eq!(outcome.get(), Some(false));
        let elapsed = clock.now_ms() - elapsed;
        assert!((SHORT_MS..2 * SHORT_MS).contains(&elapsed), "elapsed {elapsed}");
    }

    #[test]
    fn timeout_before_steal() {
        let (clock, scheduler) = mock();
        let lock = steal_only(&clock, &scheduler);
        assert!(!lock.lock_timed_wait_steal_old_blocking(SHORT_MS, LONG_MS));
        let elapsed = clock.now_ms();
        assert!((SHORT_MS..2 * SHORT_MS).contains(&elapsed), "elapsed {elapsed}");
    }

    #[test]
    fn callback_timeout_before_steal() {
        let (clock, scheduler) = mock();
        let lock = steal_only(&clock, &scheduler);
        let outcome = Outcome::default();
        lock.lock_timed_wait_steal_old(SHORT_MS, LONG_MS, outcome.action());
        quiesce(&clock, &scheduler);
        assert_eq!(outcome.get(), Some(false));
        let elapsed = clock.now_ms();
        assert!((SHORT_MS..2 * SHORT_MS).contains(&elapsed), "elapsed {elapsed}");
    }

    #[test]
    fn steal_before_timeout() {
        let (clock, scheduler) = mock();
        let lock = steal_only(&clock, &scheduler);
        assert!(lock.lock_timed_wait_steal_old_blocking(LONG_MS, SHORT_MS));
        let elapsed = clock.now_ms();
        assert!((SHORT_MS..2 * SHORT_MS).contains(&elapsed), "elapsed {elapsed}");
    }

    #[test]
    fn callback_steal_before_timeout() {
        let (clock, scheduler) = mock();
        let lock = steal_only(&clock, &scheduler);
        let outcome = Outcome::default();
        lock.lock_timed_wait_steal_old(LONG_MS, SHORT_MS, outcome.action());
        quiesce(&clock, &scheduler);
        assert_eq!(outcome.get(), Some(true));
        let elapsed = clock.now_ms();
        assert!((SHORT_MS..2 * SHORT_MS).contains(&elapsed), "elapsed {elapsed}");
    }

    #[test]
    fn scheduler_drop_cancels_retry() {
        let (_clock, scheduler) = mock();
        let lock: PollingLock<_> = PollingLock::new(NeverLock, Arc::clone(&scheduler));
        let outcome = Outcome::default();
        lock.lock_timed_wait(LONG_MS, outcome.action());
        assert_eq!(outcome.get(), None);
        let weak = Arc::downgrade(&scheduler);
        drop(lock);
        drop(scheduler);
        assert!(weak.upgrade().is_none());
        assert_eq!(outcome.get(), Some(false));
    }

    #[test]
    fn retries_back_off() {
        let (clock, scheduler) = mock();
        let backend = BusyUntil {
            clock: Arc::clone(&clock),
            free_at_ms: 80,
            attempts: Mutex::new(Vec::new()),
        };
        let policy = PollPolicy::default().with_spin_attempts(1);
        let lock: PollingLock<_> =
            PollingLock::with_policy(backend, Arc::clone(&scheduler), policy);
        let outcome = Outcome::default();
        lock.lock_timed_wait_steal_old(500, 100, outcome.action());
        quiesce(&clock, &scheduler);
        assert_eq!(outcome.get(), Some(true));
        let attempts = lock.backend().attempts.lock().clone();
        assert_eq!(attempts, [0, 1, 3, 7, 14, 25, 42, 68, 108]);
    }
}
