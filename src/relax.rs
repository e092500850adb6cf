// Modified version of relax.rs from spin-rs to support Loom yielding and
// exponential backoff.
//
// Original file at its most recent change (at the time of writing):
// https://github.com/mvdnes/spin-rs/blob/5860ee114094cf200b97348ff332155fbd7159b4/src/relax.rs
//
// Copyright (c) 2014 Mathijs van de Nes
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Strategies that determine how a thread waits on a short critical section.
//!
//! Two places in this crate wait without involving the [`Scheduler`]: the
//! slot table's per-bucket spin lock, and the bounded busy-spin fast path of
//! the [`PollingLock`] adaptor. Both are generic over a [`Relax`] strategy.
//!
//! [`Scheduler`]: crate::scheduler::Scheduler
//! [`PollingLock`]: crate::polling::PollingLock

use crate::cfg::hint;

/// A trait implemented by spinning relax strategies.
pub trait Relax {
    /// Initialize the state for the relaxing operation, if any.
    fn new() -> Self;

    /// Perform the relaxing operation during a period of contention.
    fn relax(&mut self);
}

/// A strategy that rapidly spins while informing the CPU that it should power
/// down non-essential components via [`core::hint::spin_loop`].
///
/// Spinning is only sensible here because every critical section guarded by
/// it is a handful of loads and stores against one bucket of the slot table.
pub struct Spin;

impl Relax for Spin {
    #[inline(always)]
    fn new() -> Self {
        Self
    }

    #[inline(always)]
    fn relax(&mut self) {
        hint::spin_loop();
    }
}

/// A strategy that yields the current time slice to the scheduler in favour of
/// other threads or processes.
#[cfg(any(feature = "yield", loom, test))]
#[cfg_attr(docsrs, doc(cfg(feature = "yield")))]
pub struct Yield;

#[cfg(any(feature = "yield", all(test, not(loom))))]
impl Relax for Yield {
    #[inline(always)]
    fn new() -> Self {
        Self
    }

    #[inline]
    fn relax(&mut self) {
        std::thread::yield_now();
    }
}

/// When running Loom models, we must call Loom's `yield_now` to tell Loom that
/// another thread needs to be scheduled in order for the current one to make
/// progress.
#[cfg(all(loom, test))]
impl Relax for Yield {
    #[inline(always)]
    fn new() -> Self {
        Self
    }

    #[inline(always)]
    fn relax(&mut self) {
        crate::cfg::thread::yield_now();
    }
}

/// A strategy that rapidly spins, without telling the CPU to do any powering down.
///
/// Used by the polling adaptor's fast path, where each iteration already pays
/// for a full `try_lock` attempt against the backend.
pub struct Loop;

impl Relax for Loop {
    #[inline(always)]
    fn new() -> Self {
        Self
    }

    #[inline(always)]
    fn relax(&mut self) {}
}

// Exponential backoff is based on the crossbeam-utils implementation.
// link to most recent change (as the time of writing):
// https://github.com/crossbeam-rs/crossbeam/blob/371de8c2d304db07662450995848f3dc9598ac99/crossbeam-utils/src/backoff.rs
//
// Copyright (c) 2019 The Crossbeam Project Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

/// A strategy that, as [`Spin`], will run a busy-wait spin-loop, except this
/// implementation will perform exponential backoff.
///
/// This is the default strategy of the slot table bucket lock: a full bucket
/// scan is short, but many processes may hash onto the same bucket.
pub struct SpinBackoff {
    step: Step,
}

impl SpinBackoff {
    const SPIN_LIMIT: u32 = 6;
}

impl Relax for SpinBackoff {
    #[inline(always)]
    fn new() -> Self {
        Self { step: Step(0) }
    }

    #[inline(always)]
    fn relax(&mut self) {
        self.step.spin_to(Self::SPIN_LIMIT);
        self.step.step_to(Self::SPIN_LIMIT);
    }
}

/// A strategy that, as [`Yield`], will yield back to the OS scheduler, but only
/// after performing exponential backoff in a spin loop within a threshold.
#[cfg(feature = "yield")]
#[cfg_attr(docsrs, doc(cfg(feature = "yield")))]
pub struct YieldBackoff {
    step: Step,
}

#[cfg(feature = "yield")]
impl YieldBackoff {
    const SPIN_LIMIT: u32 = SpinBackoff::SPIN_LIMIT;
    const YIELD_LIMIT: u32 = 10;
}

#[cfg(feature = "yield")]
impl Relax for YieldBackoff {
    #[inline(always)]
    fn new() -> Self {
        Self { step: Step(0) }
    }

    #[inline(always)]
    fn relax(&mut self) {
        if self.step.0 <= Self::SPIN_LIMIT {
            self.step.spin();
        } else {
            crate::cfg::thread::yield_now();
        }
        self.step.step_to(Self::YIELD_LIMIT);
    }
}

/// Keeps count of the number of steps taken.
struct Step(u32);

impl Step {
    /// Unbounded backoff spinning.
    #[cfg(feature = "yield")]
    fn spin(&self) {
        for _ in 0..1 << self.0 {
            hint::spin_loop();
        }
    }

    /// Bounded backoff spinning.
    fn spin_to(&self, max: u32) {
        for _ in 0..1 << self.0.min(max) {
            hint::spin_loop();
        }
    }

    /// Bounded step increment.
    fn step_to(&mut self, end: u32) {
        if self.0 <= end {
            self.0 += 1;
        }
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use super::{Loop, Relax, Spin, SpinBackoff, Step, Yield};

    fn relax_n<R: Relax>(n: usize) {
        let mut relax = R::new();
        for _ in 0..n {
            relax.relax();
        }
    }

    #[test]
    fn strategies_terminate() {
        relax_n::<Spin>(16);
        relax_n::<Loop>(16);
        relax_n::<Yield>(16);
        relax_n::<SpinBackoff>(16);
    }

    #[cfg(feature = "yield")]
    #[test]
    fn yield_backoff_terminates() {
        relax_n::<super::YieldBackoff>(32);
    }

    #[test]
    fn step_is_bounded() {
        let mut step = Step(0);
        for _ in 0..100 {
            step.step_to(SpinBackoff::SPIN_LIMIT);
        }
        assert_eq!(step.0, SpinBackoff::SPIN_LIMIT + 1);
    }
}
