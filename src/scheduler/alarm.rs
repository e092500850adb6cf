use core::fmt;

use crate::action::BoxAction;

/// Position of an alarm in the outstanding queue.
///
/// Alarms are ordered by wakeup time, ties broken by insertion order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct AlarmKey {
    pub wakeup_us: i64,
    pub index: u64,
}

/// Handle to an alarm, used to cancel it.
///
/// A handle stays valid after its alarm fires or is cancelled: cancelling it
/// then is a no-op that reports `false`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AlarmId(pub(crate) AlarmKey);

impl AlarmId {
    /// The time at which the alarm was scheduled to fire.
    pub fn wakeup_us(&self) -> i64 {
        self.0.wakeup_us
    }
}

/// What an outstanding alarm does when it fires or is cancelled.
pub(crate) enum Alarm {
    /// A caller supplied action.
    User(BoxAction),
    /// The deadline of a blocking timed wait. The waiter notices the alarm
    /// left the queue, so it carries nothing.
    Deadline,
    /// The deadline of a non-blocking timed wait. The callback is invoked on
    /// either outcome.
    Wait(Box<dyn FnOnce() + Send>),
}

impl Alarm {
    pub(crate) fn run(self) {
        match self {
            Self::User(action) => action.run(),
            Self::Deadline => {}
            Self::Wait(callback) => callback(),
        }
    }

    pub(crate) fn cancel(self) {
        match self {
            Self::User(action) => action.cancel(),
            Self::Deadline => {}
            Self::Wait(callback) => callback(),
        }
    }
}

impl fmt::Debug for Alarm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(_) => f.write_str("User"),
            Self::Deadline => f.write_str("Deadline"),
            Self::Wait(_) => f.write_str("Wait"),
        }
    }
}
