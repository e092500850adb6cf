//! A test-and-test-and-set spin lock.
//!
//! [`RawSpinLock`] guards each bucket of a [`SlotTable`]. Critical sections
//! there are a handful of loads and stores, so waiters spin instead of
//! parking, pacing themselves with the relax strategy `R`.
//!
//! The lock implements [`lock_api::RawMutex`], so it composes with
//! [`lock_api::Mutex`] like any other raw mutex:
//!
//! ```
//! use namedlock::relax::Spin;
//! use namedlock::spin::RawSpinLock;
//!
//! type Mutex<T> = lock_api::Mutex<RawSpinLock<Spin>, T>;
//!
//! let mutex = Mutex::new(0);
//! *mutex.lock() += 1;
//! assert_eq!(*mutex.lock(), 1);
//! ```
//!
//! [`SlotTable`]: crate::slot::SlotTable

use core::fmt;
use core::marker::PhantomData;
use core::sync::atomic::Ordering::{Acquire, Relaxed, Release};

use crate::cfg::atomic::AtomicBool;
use crate::relax::Relax;

/// A raw spin lock, relaxing with `R` while contended.
pub struct RawSpinLock<R> {
    locked: AtomicBool,
    relax: PhantomData<fn() -> R>,
}

impl<R> RawSpinLock<R> {
    /// Creates a new, unlocked and core based spin lock (const).
    #[cfg(not(all(loom, test)))]
    pub const fn new() -> Self {
        Self { locked: AtomicBool::new(false), relax: PhantomData }
    }

    /// Creates a new, unlocked and loom based spin lock (non-const).
    #[cfg(all(loom, test))]
    #[cfg(not(tarpaulin_include))]
    pub fn new() -> Self {
        Self { locked: AtomicBool::new(false), relax: PhantomData }
    }

    /// Tries to take the lock with acquire ordering.
    pub fn try_lock_acquire(&self) -> bool {
        self.locked.compare_exchange(false, true, Acquire, Relaxed).is_ok()
    }

    /// Tries to take the lock with acquire ordering and weak exchange.
    pub fn try_lock_acquire_weak(&self) -> bool {
        self.locked.compare_exchange_weak(false, true, Acquire, Relaxed).is_ok()
    }

    /// Returns `true` if the lock is currently held.
    ///
    /// This function does not guarantee strong ordering, only atomicity.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Relaxed)
    }

    /// Releases the lock.
    ///
    /// Callers must hold the lock. Releasing a lock held by someone else
    /// breaks mutual exclusion but not memory safety, since the lock guards
    /// no data of its own.
    pub fn unlock(&self) {
        self.locked.store(false, Release);
    }
}

impl<R: Relax> RawSpinLock<R> {
    /// Takes the lock, spinning until it is free.
    pub fn lock(&self) {
        while !self.try_lock_acquire_weak() {
            self.wait_lock_relaxed();
        }
    }

    // Spin on a relaxed load until the lock looks free, so contended waiters
    // do not bounce the cache line with failed exchanges.
    fn wait_lock_relaxed(&self) {
        let mut relax = R::new();
        while self.locked.load(Relaxed) {
            relax.relax();
        }
    }
}

#[cfg(not(all(loom, test)))]
impl<R> Default for RawSpinLock<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> fmt::Debug for RawSpinLock<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawSpinLock").field("locked", &self.is_locked()).finish()
    }
}

#[cfg(not(all(loom, test)))]
unsafe impl<R: Relax> lock_api::RawMutex for RawSpinLock<R> {
    type GuardMarker = lock_api::GuardSend;

    // The constant is only a template: every mutex built from it owns a copy.
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();

    #[inline]
    fn lock(&self) {
        Self::lock(self);
    }

    #[inline]
    fn try_lock(&self) -> bool {
        self.try_lock_acquire()
    }

    #[inline]
    unsafe fn unlock(&self) {
        Self::unlock(self);
    }

    #[inline]
    fn is_locked(&self) -> bool {
        Self::is_locked(self)
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::Arc;
    use std::thread;

    use super::RawSpinLock;
    use crate::relax::{Loop, Spin, SpinBackoff};

    type Mutex<T, R> = lock_api::Mutex<RawSpinLock<R>, T>;

    #[test]
    fn try_lock_fails_while_held() {
        let lock = RawSpinLock::<Spin>::new();
        assert!(lock.try_lock_acquire());
        assert!(lock.is_locked());
        assert!(!lock.try_lock_acquire());
        lock.unlock();
        assert!(!lock.is_locked());
        assert!(lock.try_lock_acquire());
    }

    #[test]
    fn mutex_guard_releases() {
        let mutex: Mutex<_, Loop> = Mutex::new(());
        let guard = mutex.lock();
        assert!(mutex.is_locked());
        assert!(mutex.try_lock().is_none());
        drop(guard);
        assert!(mutex.try_lock().is_some());
    }

    fn contended_counter<R: crate::relax::Relax + 'static>() {
        const THREADS: usize = 8;
        const ITERS: usize = 1000;
        let mutex: Arc<Mutex<usize, R>> = Arc::new(Mutex::new(0));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let mutex = Arc::clone(&mutex);
                thread::spawn(move || {
                    for _ in 0..ITERS {
                        *mutex.lock() += 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*mutex.lock(), THREADS * ITERS);
    }

    #[test]
    fn contended_counter_spin() {
        contended_counter::<Spin>();
    }

    #[test]
    fn contended_counter_backoff() {
        contended_counter::<SpinBackoff>();
    }

    #[cfg(feature = "yield")]
    #[test]
    fn contended_counter_yield_backoff() {
        contended_counter::<crate::relax::YieldBackoff>();
    }
}

#[cfg(all(loom, test))]
mod model {
    use crate::loom::models;
    use crate::relax::Yield;

    #[test]
    fn try_lock_join() {
        models::try_lock_join::<Yield>();
    }

    #[test]
    fn lock_join() {
        models::lock_join::<Yield>();
    }

    #[test]
    fn mixed_lock_join() {
        models::mixed_lock_join::<Yield>();
    }
}
