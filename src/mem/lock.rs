use core::fmt;
use std::sync::Arc;

use log::trace;

use super::state::StealKey;
use super::Shared;
use crate::action::{BoxAction, Delivery};
use crate::lock::NamedLock;

/// An outstanding lock request.
pub(crate) struct Request {
    pub action: BoxAction,
    pub cancel_time_ms: i64,
    pub steal_ms: Option<i64>,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("cancel_time_ms", &self.cancel_time_ms)
            .field("steal_ms", &self.steal_ms)
            .finish_non_exhaustive()
    }
}

/// Per handle bookkeeping, owned by the state of its name.
///
/// A waiter is pending while it carries a request and held while it carries
/// a grant time. It is never both.
#[derive(Debug, Default)]
pub(crate) struct Waiter {
    pub request: Option<Request>,
    pub grant_time_ms: Option<i64>,
    pub wakeup_time_ms: i64,
    // Set while the waiter's keys sit in the ordered sets, whose order is
    // derived from `wakeup_time_ms` and the request's `steal_ms`.
    pub in_ordered_sets: bool,
}

impl Waiter {
    pub fn is_pending(&self) -> bool {
        self.request.is_some()
    }

    pub fn steal_key(&self, sequence: i64) -> Option<StealKey> {
        let steal_ms = self.request.as_ref()?.steal_ms?;
        Some(StealKey { steal_ms, sequence })
    }

    /// The earlier of the cancel deadline and the steal deadline against a
    /// holder granted at `held_grant_time_ms`. Without a holder, only the
    /// cancel deadline counts.
    pub fn calculate_wakeup_time(&self, held_grant_time_ms: Option<i64>) -> i64 {
        let Some(request) = &self.request else {
            return self.wakeup_time_ms;
        };
        match (request.steal_ms, held_grant_time_ms) {
            (Some(steal_ms), Some(grant_ms)) => {
                request.cancel_time_ms.min(grant_ms.saturating_add(steal_ms))
            }
            _ => request.cancel_time_ms,
        }
    }

    pub fn set_wakeup_time(&mut self, wakeup_time_ms: i64) {
        debug_assert!(!self.in_ordered_sets, "wakeup time changed while queued");
        self.wakeup_time_ms = wakeup_time_ms;
    }
}

/// A handle on a named lock of a [`MemLockManager`].
///
/// Dropping a pending handle cancels its request. Dropping a holding handle
/// releases the lock. Handles may outlive their manager, after which every
/// new request is cancelled.
///
/// [`MemLockManager`]: crate::mem::MemLockManager
pub struct MemLock {
    shared: Arc<Shared>,
    name: Arc<str>,
    sequence: i64,
}

impl MemLock {
    pub(crate) fn new(shared: Arc<Shared>, name: Arc<str>, sequence: i64) -> Self {
        Self { shared, name, sequence }
    }

    /// Requests the lock, waiting up to `wait_ms` for it to be released.
    pub fn lock_timed_wait(&self, wait_ms: i64, action: BoxAction) {
        self.request(wait_ms, None, action);
    }

    /// Requests the lock, waiting up to `wait_ms`, and takes it from a holder
    /// that has kept it for `steal_ms`.
    pub fn lock_timed_wait_steal_old(&self, wait_ms: i64, steal_ms: i64, action: BoxAction) {
        self.request(wait_ms, Some(steal_ms), action);
    }

    /// Releases the lock if this handle holds it.
    pub fn unlock(&self) {
        self.shared.run(|core, now_ms| {
            core.with_state(&self.name, now_ms, |state, cx| state.unlock_held(self.sequence, cx));
        });
    }

    /// Returns `true` if this handle owns the lock.
    pub fn held(&self) -> bool {
        self.shared.run(|core, _| {
            core.states.get(&*self.name).map_or(false, |state| state.held(self.sequence))
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identifier of this handle, unique within its manager.
    pub fn sequence(&self) -> i64 {
        self.sequence
    }

    fn request(&self, wait_ms: i64, steal_ms: Option<i64>, action: BoxAction) {
        self.shared.run(|core, now_ms| {
            if !core.attached {
                trace!("lock `{}` requested after its manager was dropped", self.name);
                core.deliveries.push(Delivery::Cancel(action));
                return;
            }
            let mut action = Some(action);
            core.with_state(&self.name, now_ms, |state, cx| {
                if let Some(action) = action.take() {
                    state.lock_timed_wait(self.sequence, wait_ms, steal_ms, action, cx);
                }
            });
            if let Some(action) = action {
                core.deliveries.push(Delivery::Cancel(action));
            }
            core.wakeup(now_ms);
        });
    }
}

impl Drop for MemLock {
    fn drop(&mut self) {
        self.shared.run(|core, now_ms| {
            let empty = core
                .with_state(&self.name, now_ms, |state, cx| state.remove_lock(self.sequence, cx));
            if empty == Some(true) {
                core.states.remove(&*self.name);
            }
        });
    }
}

impl NamedLock for MemLock {
    fn lock_timed_wait(&self, wait_ms: i64, action: BoxAction) {
        MemLock::lock_timed_wait(self, wait_ms, action);
    }

    fn lock_timed_wait_steal_old(&self, wait_ms: i64, steal_ms: i64, action: BoxAction) {
        MemLock::lock_timed_wait_steal_old(self, wait_ms, steal_ms, action);
    }

    fn unlock(&self) {
        MemLock::unlock(self);
    }

    fn held(&self) -> bool {
        MemLock::held(self)
    }

    fn name(&self) -> String {
        self.name.to_string()
    }
}

impl fmt::Debug for MemLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemLock")
            .field("name", &self.name)
            .field("sequence", &self.sequence)
            .finish()
    }
}
