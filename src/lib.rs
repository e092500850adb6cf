//! Named locks with timed waiting and lock stealing, driven by a cooperative
//! alarm scheduler.
//!
//! A named lock is a critical section identified by a string. Any number of
//! handles may be created on the same name, and at most one of them holds the
//! lock at a time. Requests never block: each one carries an [`Action`] that
//! is told exactly once whether the lock was granted ([`Action::run`]) or
//! refused ([`Action::cancel`]).
//!
//! A request may wait for a bounded time, and may ask to steal the lock from
//! a holder that has kept it for too long. The holder is not told about the
//! steal: it finds out when its own `unlock` turns into a no-op.
//!
//! ## Components
//!
//! - [`scheduler::Scheduler`]: a thread-safe timer queue whose alarms run on
//!   whichever thread drives it, with timed waits that a signal can end
//!   early.
//! - [`mem::MemLockManager`]: the in-memory arbiter. It keeps one state per
//!   name and one ordered index of every deadline, and is driven by calling
//!   [`wakeup`] at [`next_wakeup_time_ms`].
//! - [`scheduled::ScheduledLockManager`]: a `MemLockManager` that keeps a
//!   scheduler alarm armed at its next deadline, so nobody has to drive it by
//!   hand.
//! - [`polling::PollingLock`]: offers the same contract over any backend that
//!   can only be tried, by retrying on the scheduler with back-off.
//! - [`slot::SlotTable`]: such a backend, a bucketed table of held names laid
//!   out as one shared segment.
//!
//! Every component reads time through an injected [`clock::Clock`]. With a
//! [`clock::MockClock`], the scheduler jumps straight to its next deadline
//! instead of sleeping, so timing behaviour is fully deterministic in tests.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use namedlock::action::action_once;
//! use namedlock::clock::MockClock;
//! use namedlock::lock::NamedLock;
//! use namedlock::mem::MemLockManager;
//!
//! let clock = Arc::new(MockClock::new(0));
//! let manager = MemLockManager::new(clock.clone());
//! let holder = manager.create_named_lock("db");
//! let stealer = manager.create_named_lock("db");
//!
//! assert!(holder.try_lock());
//! stealer.lock_timed_wait_steal_old(1_000, 100, action_once(|ok| assert!(ok)));
//! assert_eq!(manager.next_wakeup_time_ms(), Some(100));
//!
//! clock.set_time_ms(100);
//! manager.wakeup();
//! assert!(stealer.held());
//! assert!(!holder.held());
//! ```
//!
//! ## Features
//!
//! This crate does not provide any default features. Features that can be
//! enabled are:
//!
//! ### yield
//!
//! The `yield` feature enables the [`relax::YieldBackoff`] strategy, which
//! backs off exponentially and then calls [`std::thread::yield_now`] while a
//! slot table bucket stays contended.
//!
//! [`Action`]: action::Action
//! [`Action::run`]: action::Action::run
//! [`Action::cancel`]: action::Action::cancel
//! [`wakeup`]: mem::MemLockManager::wakeup
//! [`next_wakeup_time_ms`]: mem::MemLockManager::next_wakeup_time_ms

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod action;
pub mod clock;
pub mod error;
pub mod lock;
pub mod mem;
pub mod polling;
pub mod relax;
pub mod scheduled;
pub mod scheduler;
pub mod spin;

#[cfg(not(all(loom, test)))]
pub mod slot;

pub(crate) mod cfg;

#[cfg(all(not(loom), test))]
pub(crate) mod test;

#[cfg(all(loom, test))]
#[cfg(not(tarpaulin_include))]
pub(crate) mod loom;
