//! Loom models for the spin lock behind slot table buckets.

use loom::cell::UnsafeCell;

use crate::relax::Relax;
use crate::spin::RawSpinLock;

/// A counter only ever touched under its spin lock.
///
/// The count lives in Loom's [`UnsafeCell`], so the model checker flags any
/// access the lock failed to serialize.
pub struct Counter<R> {
    lock: RawSpinLock<R>,
    value: UnsafeCell<usize>,
}

// SAFETY: Every access to `value` happens with `lock` held.
unsafe impl<R> Sync for Counter<R> {}

impl<R: Relax> Counter<R> {
    fn new() -> Self {
        Self { lock: RawSpinLock::new(), value: UnsafeCell::new(0) }
    }

    fn inc(&self) {
        self.lock.lock();
        // SAFETY: The lock is held.
        self.value.with_mut(|value| unsafe { *value += 1 });
        self.lock.unlock();
    }

    fn try_inc(&self) {
        if self.lock.try_lock_acquire() {
            // SAFETY: The lock is held.
            self.value.with_mut(|value| unsafe { *value += 1 });
            self.lock.unlock();
        }
    }

    fn get(&self) -> usize {
        self.lock.lock();
        // SAFETY: The lock is held.
        let value = self.value.with(|value| unsafe { *value });
        self.lock.unlock();
        value
    }
}

pub mod models {
    use core::array;

    use loom::sync::Arc;
    use loom::{model, thread};

    use super::Counter;
    use crate::relax::Relax;

    // Three threads make the lock model run for too long.
    const LOCKS: usize = 2;
    const TRY_LOCKS: usize = 3;

    /// Concurrent `try_lock_acquire` calls serialize every increment.
    pub fn try_lock_join<R: Relax + 'static>() {
        model(|| {
            const RUNS: usize = TRY_LOCKS;
            let counter = Arc::new(Counter::<R>::new());
            let handles: [_; RUNS] = array::from_fn(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || counter.try_inc())
            });
            for handle in handles {
                handle.join().unwrap();
            }
            assert!((1..=RUNS).contains(&counter.get()));
        });
    }

    /// Concurrent `lock` calls serialize every increment and lose none.
    pub fn lock_join<R: Relax + 'static>() {
        model(|| {
            const RUNS: usize = LOCKS;
            let counter = Arc::new(Counter::<R>::new());
            let handles: [_; RUNS] = array::from_fn(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || counter.inc())
            });
            for handle in handles {
                handle.join().unwrap();
            }
            assert_eq!(RUNS, counter.get());
        });
    }

    /// Mixed `lock` and `try_lock_acquire` calls serialize every increment.
    pub fn mixed_lock_join<R: Relax + 'static>() {
        model(|| {
            const RUNS: usize = LOCKS;
            let counter = Arc::new(Counter::<R>::new());
            let handles: [_; RUNS] = array::from_fn(|run| {
                let counter = Arc::clone(&counter);
                let f = if run % 2 == 0 { Counter::<R>::inc } else { Counter::<R>::try_inc };
                thread::spawn(move || f(&counter))
            });
            for handle in handles {
                handle.join().unwrap();
            }
            assert!((1..=RUNS).contains(&counter.get()));
        });
    }
}
