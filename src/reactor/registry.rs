use crate::backend::WatchHandle;

use libc::c_int;
use std::collections::HashMap;
use std::rc::Rc;

/// Identifier of an interval or timeout registration.
///
/// Allocated monotonically by the reactor, never reused for its
/// lifetime, and shared between both timer kinds.
pub type TimerId = u64;

/// Which readiness table a registration lives in.
///
/// Timers are keyed separately by [`TimerId`]; a repeating and a
/// one-shot timer differ only by the `repeat` flag of their slot.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum IoKind {
    Read,
    Write,
    Signal,
}

/// Registry slot of one interval or timeout.
///
/// The backend watch invokes a dispatch trampoline, not the user
/// callback, so the callback must be resolvable by timer id at fire
/// time.
pub(crate) struct TimerSlot {
    /// Handle of the backend timer watch; cancellation targets this,
    /// never a reconstructed value.
    pub(crate) handle: WatchHandle,

    /// `true` for intervals, `false` for one-shot timeouts.
    pub(crate) repeat: bool,

    /// User callback, invoked with the timer id.
    pub(crate) callback: Rc<dyn Fn(TimerId)>,
}

/// The reactor's registration tables.
///
/// Maps (event kind, identity key) to what is needed later: the backend
/// handle for cancellation, plus the user callback for timers. At most
/// one entry exists per (kind, key); only the loop thread touches it.
#[derive(Default)]
pub(crate) struct Registry {
    reads: HashMap<c_int, WatchHandle>,
    writes: HashMap<c_int, WatchHandle>,
    signals: HashMap<c_int, WatchHandle>,
    timers: HashMap<TimerId, TimerSlot>,
}

impl Registry {
    fn table(&mut self, kind: IoKind) -> &mut HashMap<c_int, WatchHandle> {
        match kind {
            IoKind::Read => &mut self.reads,
            IoKind::Write => &mut self.writes,
            IoKind::Signal => &mut self.signals,
        }
    }

    /// Records a readiness registration, returning the displaced handle
    /// if the key was already registered.
    pub(crate) fn insert(
        &mut self,
        kind: IoKind,
        key: c_int,
        handle: WatchHandle,
    ) -> Option<WatchHandle> {
        self.table(kind).insert(key, handle)
    }

    /// Removes a readiness registration, returning its handle.
    pub(crate) fn remove(&mut self, kind: IoKind, key: c_int) -> Option<WatchHandle> {
        self.table(kind).remove(&key)
    }

    /// Records a timer registration.
    pub(crate) fn insert_timer(&mut self, id: TimerId, slot: TimerSlot) {
        self.timers.insert(id, slot);
    }

    /// Looks up a timer slot without removing it.
    pub(crate) fn timer(&self, id: TimerId) -> Option<&TimerSlot> {
        self.timers.get(&id)
    }

    /// Removes a timer registration, returning its slot.
    pub(crate) fn remove_timer(&mut self, id: TimerId) -> Option<TimerSlot> {
        self.timers.remove(&id)
    }

    /// Empties every table, returning all live backend handles.
    ///
    /// Used on reactor teardown so each watch can be cancelled.
    pub(crate) fn drain_handles(&mut self) -> Vec<WatchHandle> {
        let mut handles: Vec<WatchHandle> = Vec::new();

        handles.extend(self.reads.drain().map(|(_, handle)| handle));
        handles.extend(self.writes.drain().map(|(_, handle)| handle));
        handles.extend(self.signals.drain().map(|(_, handle)| handle));
        handles.extend(self.timers.drain().map(|(_, slot)| slot.handle));

        handles
    }
}
