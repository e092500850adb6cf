//! One-shot callbacks with two exits.
//!
//! An [`Action`] is consumed by exactly one of [`Action::run`] or
//! [`Action::cancel`]. Both take `self: Box<Self>`, so the type system rules
//! out delivering the same action twice.

use core::fmt;

/// A one-shot callback that is either run or cancelled, exactly once.
pub trait Action: Send {
    /// Delivers the success outcome.
    fn run(self: Box<Self>);

    /// Delivers the failure outcome.
    fn cancel(self: Box<Self>);
}

/// A type-erased [`Action`].
pub type BoxAction = Box<dyn Action>;

/// Builds an action from a pair of closures, one per outcome.
///
/// # Example
///
/// ```
/// use std::sync::mpsc;
/// use namedlock::action::{self, Action};
///
/// let (tx, rx) = mpsc::channel();
/// let tx2 = tx.clone();
/// let granted = action::action(
///     move || tx.send("run").unwrap(),
///     move || tx2.send("cancel").unwrap(),
/// );
/// granted.cancel();
/// assert_eq!(rx.recv().unwrap(), "cancel");
/// ```
pub fn action<R, C>(on_run: R, on_cancel: C) -> BoxAction
where
    R: FnOnce() + Send + 'static,
    C: FnOnce() + Send + 'static,
{
    Box::new(FnAction { on_run, on_cancel })
}

/// Builds an action from one closure receiving `true` on run and `false` on
/// cancel.
pub fn action_once<F>(f: F) -> BoxAction
where
    F: FnOnce(bool) + Send + 'static,
{
    Box::new(OnceAction(f))
}

struct FnAction<R, C> {
    on_run: R,
    on_cancel: C,
}

impl<R, C> Action for FnAction<R, C>
where
    R: FnOnce() + Send,
    C: FnOnce() + Send,
{
    fn run(self: Box<Self>) {
        (self.on_run)();
    }

    fn cancel(self: Box<Self>) {
        (self.on_cancel)();
    }
}

struct OnceAction<F>(F);

impl<F: FnOnce(bool) + Send> Action for OnceAction<F> {
    fn run(self: Box<Self>) {
        (self.0)(true);
    }

    fn cancel(self: Box<Self>) {
        (self.0)(false);
    }
}

/// An outcome chosen while a mutex was held, delivered after it is released.
pub(crate) enum Delivery {
    Run(BoxAction),
    Cancel(BoxAction),
}

impl Delivery {
    pub(crate) fn deliver(self) {
        match self {
            Self::Run(action) => action.run(),
            Self::Cancel(action) => action.cancel(),
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Run(_) => f.write_str("Run"),
            Self::Cancel(_) => f.write_str("Cancel"),
        }
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::{action, action_once, Delivery};

    #[test]
    fn pair_runs_one_side() {
        let out = Arc::new(Mutex::new(Vec::new()));
        let (ran, cancelled) = (Arc::clone(&out), Arc::clone(&out));
        let a = action(move || ran.lock().push("run"), move || cancelled.lock().push("cancel"));
        a.run();
        assert_eq!(*out.lock(), ["run"]);
    }

    #[test]
    fn once_reports_outcome() {
        let out = Arc::new(Mutex::new(Vec::new()));
        let (first, second) = (Arc::clone(&out), Arc::clone(&out));
        Delivery::Run(action_once(move |ok| first.lock().push(ok))).deliver();
        Delivery::Cancel(action_once(move |ok| second.lock().push(ok))).deliver();
        assert_eq!(*out.lock(), [true, false]);
    }
}
