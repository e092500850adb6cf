use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use log::{debug, error};

use super::lock::{Request, Waiter};
use super::Context;
use crate::action::{BoxAction, Delivery};

/// Orders waiters by the time they next need attention.
///
/// Field order matters: ties on the wakeup time fall back to the lock name,
/// then to the handle sequence, so two distinct handles never compare equal.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct WakeupKey {
    pub wakeup_time_ms: i64,
    pub name: Arc<str>,
    pub sequence: i64,
}

/// Orders the stealers of one name by patience, most impatient first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct StealKey {
    pub steal_ms: i64,
    pub sequence: i64,
}

/// Arbiter for every handle sharing one lock name.
#[derive(Debug)]
pub(crate) struct MemLockState {
    name: Arc<str>,
    current_owner: Option<i64>,
    waiters: HashMap<i64, Waiter>,
    pending_locks: BTreeSet<WakeupKey>,
    pending_steals: BTreeSet<StealKey>,
}

impl MemLockState {
    pub fn new(name: Arc<str>) -> Self {
        Self {
            name,
            current_owner: None,
            waiters: HashMap::new(),
            pending_locks: BTreeSet::new(),
            pending_steals: BTreeSet::new(),
        }
    }

    /// Number of live handles on this name.
    pub fn lock_count(&self) -> usize {
        self.waiters.len()
    }

    pub fn create_lock(&mut self, sequence: i64) {
        self.waiters.insert(sequence, Waiter::default());
    }

    /// Forgets the handle `sequence`, denying or releasing it first.
    ///
    /// Returns `true` once no handle remains, at which point the state can be
    /// dropped.
    pub fn remove_lock(&mut self, sequence: i64, cx: &mut Context<'_>) -> bool {
        if self.is_pending(sequence) {
            self.deny(sequence, cx);
        } else if self.held(sequence) {
            self.unlock(cx);
        }
        self.waiters.remove(&sequence);
        if self.lock_count() == 0 {
            debug_assert!(
                self.pending_locks.is_empty(),
                "pending locks on `{}` outlived their handles",
                self.name
            );
            debug_assert!(
                self.pending_steals.is_empty(),
                "pending steals on `{}` outlived their handles",
                self.name
            );
            return true;
        }
        false
    }

    pub fn held(&self, sequence: i64) -> bool {
        self.current_owner == Some(sequence)
    }

    fn is_pending(&self, sequence: i64) -> bool {
        self.waiters.get(&sequence).map_or(false, Waiter::is_pending)
    }

    /// Requests the lock for `sequence`, granting it at once when free and
    /// queueing it otherwise.
    pub fn lock_timed_wait(
        &mut self,
        sequence: i64,
        wait_ms: i64,
        steal_ms: Option<i64>,
        action: BoxAction,
        cx: &mut Context<'_>,
    ) {
        let Some(waiter) = self.waiters.get(&sequence) else {
            cx.deliver(Delivery::Cancel(action));
            return;
        };
        debug_assert!(
            !waiter.is_pending() && !self.held(sequence),
            "lock `{}` requested on a busy handle",
            self.name
        );
        if waiter.is_pending() {
            error!("lock `{}` requested while pending, denying the earlier request", self.name);
            self.deny(sequence, cx);
        } else if self.held(sequence) {
            error!("lock `{}` requested while held, denying the new request", self.name);
            cx.deliver(Delivery::Cancel(action));
            return;
        }

        if self.grab_lock(sequence) {
            if let Some(waiter) = self.waiters.get_mut(&sequence) {
                waiter.grant_time_ms = Some(cx.now_ms);
            }
            debug!("lock `{}` granted to #{sequence} at {}ms", self.name, cx.now_ms);
            cx.deliver(Delivery::Run(action));
            return;
        }

        let cancel_time_ms = cx.now_ms.saturating_add(wait_ms.max(0));
        if let Some(waiter) = self.waiters.get_mut(&sequence) {
            waiter.request = Some(Request { action, cancel_time_ms, steal_ms });
        }
        self.schedule_lock(sequence, cx);
    }

    /// Makes `sequence` the owner if the lock is free. Never runs callbacks.
    pub fn grab_lock(&mut self, sequence: i64) -> bool {
        if self.current_owner.is_some() {
            return false;
        }
        self.current_owner = Some(sequence);
        true
    }

    /// Queues the pending handle `sequence` behind the current owner.
    pub fn schedule_lock(&mut self, sequence: i64, cx: &mut Context<'_>) {
        debug_assert!(self.current_owner.is_some(), "scheduling `{}` without an owner", self.name);
        let held_grant_time_ms = self.owner_grant_time_ms();
        let Some(waiter) = self.waiters.get(&sequence) else {
            return;
        };
        let mut wakeup_time_ms = waiter.calculate_wakeup_time(held_grant_time_ms);
        if let Some(steal_key) = waiter.steal_key(sequence) {
            match self.pending_steals.first().copied() {
                Some(first) if steal_key < first => {
                    // The newcomer takes over the only armed steal deadline.
                    self.reschedule(first.sequence, None, cx);
                }
                Some(_) => {
                    wakeup_time_ms = waiter.calculate_wakeup_time(None);
                }
                None => {}
            }
        }
        if let Some(waiter) = self.waiters.get_mut(&sequence) {
            waiter.set_wakeup_time(wakeup_time_ms);
        }
        self.insert_pending(sequence, cx);
    }

    /// Drops `sequence` from every ordered set. Safe when it is not queued.
    pub fn unschedule_lock(&mut self, sequence: i64, cx: &mut Context<'_>) {
        let Some(waiter) = self.waiters.get_mut(&sequence) else {
            return;
        };
        if !waiter.in_ordered_sets {
            return;
        }
        waiter.in_ordered_sets = false;
        let key = WakeupKey {
            wakeup_time_ms: waiter.wakeup_time_ms,
            name: Arc::clone(&self.name),
            sequence,
        };
        if let Some(steal_key) = waiter.steal_key(sequence) {
            self.pending_steals.remove(&steal_key);
        }
        self.pending_locks.remove(&key);
        cx.remove_pending_lock(&key);
    }

    /// Releases the lock held by `sequence`. Does nothing for other handles.
    pub fn unlock_held(&mut self, sequence: i64, cx: &mut Context<'_>) {
        if self.held(sequence) {
            self.unlock(cx);
        }
    }

    /// Releases the current owner and promotes the first pending waiter.
    pub fn unlock(&mut self, cx: &mut Context<'_>) {
        debug_assert!(self.current_owner.is_some(), "unlocking `{}` without an owner", self.name);
        let Some(owner) = self.current_owner.take() else {
            return;
        };
        if let Some(waiter) = self.waiters.get_mut(&owner) {
            waiter.grant_time_ms = None;
        }
        debug!("lock `{}` released by #{owner} at {}ms", self.name, cx.now_ms);
        self.promote_next(cx);
    }

    /// Takes the lock for `sequence`, which must be first in line, away from
    /// the current owner.
    pub fn steal_lock(&mut self, sequence: i64, cx: &mut Context<'_>) {
        debug_assert_eq!(
            self.pending_locks.first().map(|key| key.sequence),
            Some(sequence),
            "stealer is not first in line for `{}`",
            self.name
        );
        match self.current_owner {
            Some(owner) => {
                let now_ms = cx.now_ms;
                debug!("lock `{}` stolen from #{owner} by #{sequence} at {now_ms}ms", self.name);
                self.unlock(cx);
            }
            None => self.promote_next(cx),
        }
        if self.is_pending(sequence) {
            debug_assert!(false, "steal of `{}` did not grant #{sequence}", self.name);
            error!("steal of `{}` did not grant #{sequence}, denying it", self.name);
            self.deny(sequence, cx);
        }
    }

    /// Handles the deadline of the pending handle `sequence`.
    ///
    /// The wakeup time is the earlier of the cancel and steal deadlines, so a
    /// wakeup equal to the cancel time means the wait has expired.
    pub fn wakeup_lock(&mut self, sequence: i64, cx: &mut Context<'_>) {
        let Some(waiter) = self.waiters.get(&sequence) else {
            return;
        };
        let Some(request) = &waiter.request else {
            return;
        };
        if request.cancel_time_ms == waiter.wakeup_time_ms {
            debug!("lock `{}` wait of #{sequence} expired at {}ms", self.name, cx.now_ms);
            self.deny(sequence, cx);
        } else {
            self.steal_lock(sequence, cx);
        }
    }

    /// Cancels the pending request of `sequence`.
    pub fn deny(&mut self, sequence: i64, cx: &mut Context<'_>) {
        self.unschedule_lock(sequence, cx);
        let request = self.waiters.get_mut(&sequence).and_then(|waiter| waiter.request.take());
        let Some(request) = request else {
            return;
        };
        cx.deliver(Delivery::Cancel(request.action));
    }

    /// Cancels every pending request on this name.
    pub fn deny_all(&mut self, cx: &mut Context<'_>) {
        let pending: Vec<i64> = self.pending_locks.iter().map(|key| key.sequence).collect();
        for sequence in pending {
            self.deny(sequence, cx);
        }
    }

    fn grant(&mut self, sequence: i64, cx: &mut Context<'_>) {
        self.unschedule_lock(sequence, cx);
        let Some(waiter) = self.waiters.get_mut(&sequence) else {
            return;
        };
        let Some(request) = waiter.request.take() else {
            return;
        };
        waiter.grant_time_ms = Some(cx.now_ms);
        debug!("lock `{}` granted to #{sequence} at {}ms", self.name, cx.now_ms);
        cx.deliver(Delivery::Run(request.action));
    }

    fn promote_next(&mut self, cx: &mut Context<'_>) {
        let Some(next) = self.pending_locks.first().map(|key| key.sequence) else {
            return;
        };
        let promoted_steal = self.waiters.get(&next).and_then(|waiter| waiter.steal_key(next));
        if let Some(steal_key) = promoted_steal {
            self.pending_steals.remove(&steal_key);
            // The next stealer measures its patience from this grant.
            if let Some(first) = self.pending_steals.first().copied() {
                self.reschedule(first.sequence, Some(cx.now_ms), cx);
            }
        }
        self.current_owner = Some(next);
        self.grant(next, cx);
    }

    fn reschedule(&mut self, sequence: i64, held_grant_time_ms: Option<i64>, cx: &mut Context<'_>) {
        self.unschedule_lock(sequence, cx);
        if let Some(waiter) = self.waiters.get_mut(&sequence) {
            let wakeup_time_ms = waiter.calculate_wakeup_time(held_grant_time_ms);
            waiter.set_wakeup_time(wakeup_time_ms);
        }
        self.insert_pending(sequence, cx);
    }

    fn insert_pending(&mut self, sequence: i64, cx: &mut Context<'_>) {
        let Some(waiter) = self.waiters.get_mut(&sequence) else {
            return;
        };
        debug_assert!(!waiter.in_ordered_sets, "#{sequence} queued twice on `{}`", self.name);
        waiter.in_ordered_sets = true;
        let key = WakeupKey {
            wakeup_time_ms: waiter.wakeup_time_ms,
            name: Arc::clone(&self.name),
            sequence,
        };
        if let Some(steal_key) = waiter.steal_key(sequence) {
            self.pending_steals.insert(steal_key);
        }
        self.pending_locks.insert(key.clone());
        cx.add_pending_lock(key);
    }

    fn owner_grant_time_ms(&self) -> Option<i64> {
        self.current_owner
            .and_then(|owner| self.waiters.get(&owner))
            .and_then(|waiter| waiter.grant_time_ms)
    }
}
