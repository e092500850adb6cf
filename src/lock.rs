use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::action::{action_once, BoxAction};
use crate::error::TryLockError;

/// A `NamedLock` is a handle onto a critical section identified by a string.
///
/// Many handles may share a name, and at most one of them holds the lock at
/// any time. Every `lock_*` request delivers exactly one outcome to its
/// action: [`Action::run`] once the handle owns the lock, or
/// [`Action::cancel`] if the wait expired or the lock can no longer be
/// granted.
///
/// A handle carries one request at a time. Requesting the lock on a handle
/// that is already pending or holding is a programming error: it panics in
/// debug builds and is answered with a cancel in release builds.
///
/// [`Action::run`]: crate::action::Action::run
/// [`Action::cancel`]: crate::action::Action::cancel
pub trait NamedLock: Send + Sync {
    /// Requests the lock, waiting up to `wait_ms` for the current holder to
    /// release it.
    fn lock_timed_wait(&self, wait_ms: i64, action: BoxAction);

    /// Requests the lock, waiting up to `wait_ms`, and takes it by force if
    /// the current holder has kept it for more than `steal_ms`.
    fn lock_timed_wait_steal_old(&self, wait_ms: i64, steal_ms: i64, action: BoxAction);

    /// Releases the lock. Does nothing if this handle does not hold it.
    fn unlock(&self);

    /// Returns `true` if this handle believes it holds the lock.
    fn held(&self) -> bool;

    /// The name of the lock.
    fn name(&self) -> String;

    /// Requests the lock without waiting.
    ///
    /// Returns whether it was granted. Only meaningful for implementations
    /// that answer a zero wait synchronously, which every lock in this crate
    /// does.
    fn try_lock(&self) -> bool {
        let granted = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&granted);
        self.lock_timed_wait(0, action_once(move |ok| flag.store(ok, Ordering::Release)));
        granted.load(Ordering::Acquire)
    }

    /// Requests the lock without waiting, stealing it from a holder older than
    /// `steal_ms`.
    fn try_lock_steal_old(&self, steal_ms: i64) -> bool {
        let granted = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&granted);
        let action = action_once(move |ok| flag.store(ok, Ordering::Release));
        self.lock_timed_wait_steal_old(0, steal_ms, action);
        granted.load(Ordering::Acquire)
    }
}

/// A factory of [`NamedLock`] handles sharing one namespace.
pub trait NamedLockManager: Send + Sync {
    /// Creates a new handle on the lock called `name`.
    ///
    /// The handle starts out neither pending nor holding.
    fn create_named_lock(&self, name: &str) -> Box<dyn NamedLock>;
}

/// A lock backend that can only be tried, never waited on.
///
/// [`PollingLock`] turns any `TryLock` into a [`NamedLock`] by retrying on the
/// scheduler with back-off.
///
/// [`PollingLock`]: crate::polling::PollingLock
pub trait TryLock: Send + Sync {
    /// Attempts to take the lock.
    fn try_lock(&self) -> Result<(), TryLockError>;

    /// Attempts to take the lock, overriding a holder that acquired it at
    /// least `steal_ms` ago.
    ///
    /// The overridden holder is not told. Its later [`unlock`] must leave the
    /// new hold in place, even when both were taken in the same millisecond.
    ///
    /// [`unlock`]: TryLock::unlock
    fn try_lock_steal_old(&self, steal_ms: i64) -> Result<(), TryLockError>;

    /// Releases the lock if this handle took it.
    fn unlock(&self);

    /// Returns `true` if this handle believes it holds the lock.
    fn held(&self) -> bool;

    /// The name of the lock.
    fn name(&self) -> String;
}
