use super::WatchCallback;

use std::cell::Cell;
use std::cmp::Ordering;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// An entry in the backend timer queue.
///
/// `TimerEntry` represents the next firing of one persistent timer
/// watch. It is stored in a `BinaryHeap` ordered by deadline; after
/// firing, a fresh entry one period later is pushed back unless the
/// watch was cancelled in the meantime.
///
/// Cancellation is a shared flag rather than heap surgery: a cancelled
/// entry is skipped when it reaches the front of the queue.
pub(crate) struct TimerEntry {
    /// The time at which the timer should fire next.
    pub(crate) deadline: Instant,

    /// Interval between firings.
    pub(crate) period: Duration,

    /// Callback invoked on every firing.
    pub(crate) callback: WatchCallback,

    /// Cancellation flag shared with the watch table.
    pub(crate) cancelled: Rc<Cell<bool>>,
}

impl Eq for TimerEntry {}

impl PartialEq for TimerEntry {
    /// Two timer entries are equal if their deadlines are equal.
    fn eq(&self, other: &Self) -> bool {
        self.deadline.eq(&other.deadline)
    }
}

impl Ord for TimerEntry {
    /// Orders timer entries by deadline.
    ///
    /// Note that the comparison is **reversed** so that a
    /// `BinaryHeap<TimerEntry>` behaves as a min-heap,
    /// where the earliest deadline is popped first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.deadline.cmp(&self.deadline)
    }
}

impl PartialOrd for TimerEntry {
    /// Partial ordering consistent with [`Ord`].
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
