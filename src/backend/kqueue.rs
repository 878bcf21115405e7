//! macOS `kqueue`-based notification backend.
//!
//! Functionally equivalent to the Linux `epoll` backend and exposes
//! the same contract to the reactor. kqueue covers all four watch
//! kinds natively:
//! - `EVFILT_READ` / `EVFILT_WRITE` for descriptor readiness
//! - `EVFILT_SIGNAL` for signal delivery
//! - `EVFILT_TIMER` for periodic timers (millisecond resolution)
//!
//! Descriptor filters are keyed by fd, signal filters by signal
//! number, and timer filters by a dedicated ident that is never
//! reused, so a stale timer kevent from earlier in a dispatch pass
//! cannot resolve to a watch created after a cancellation.

use super::sys::{sys_close, sys_default_signal, sys_ignore_signal};
use super::{Backend, WatchCallback, WatchHandle};
use crate::utils::Slab;

use libc::{EV_ADD, EV_DELETE, EVFILT_READ, EVFILT_SIGNAL, EVFILT_TIMER, EVFILT_WRITE, c_int};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;

/// One active watch, stored under its slab token.
enum WatchEntry {
    Read { fd: RawFd, callback: WatchCallback },
    Write { fd: RawFd, callback: WatchCallback },
    Signal { signal: c_int, callback: WatchCallback },
    Timer { ident: usize, callback: WatchCallback },
}

/// macOS `kqueue` notification backend.
///
/// Single-threaded: all watch mutation and every callback run on the
/// thread calling [`run`](Backend::run).
pub struct KqueueBackend {
    /// kqueue file descriptor.
    kq: RawFd,

    /// Live-watch table; tokens double as watch handles.
    watches: RefCell<Slab<WatchEntry>>,

    /// Read watches by descriptor.
    reads: RefCell<HashMap<RawFd, usize>>,

    /// Write watches by descriptor.
    writes: RefCell<HashMap<RawFd, usize>>,

    /// Signal watches by signal number.
    signals: RefCell<HashMap<c_int, usize>>,

    /// Timer watches by kevent ident.
    ///
    /// Slab tokens are reused after removal, so timers carry their own
    /// monotonically increasing ident instead.
    timers: RefCell<HashMap<usize, usize>>,

    /// Next timer ident to hand out; never reused.
    next_timer_ident: Cell<usize>,

    /// Set by [`stop`](Backend::stop); checked between callbacks.
    stopped: Cell<bool>,
}

impl KqueueBackend {
    /// Creates a new backend with a fresh kqueue instance.
    pub fn new() -> io::Result<Self> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            kq,
            watches: RefCell::new(Slab::new(64)),
            reads: RefCell::new(HashMap::new()),
            writes: RefCell::new(HashMap::new()),
            signals: RefCell::new(HashMap::new()),
            timers: RefCell::new(HashMap::new()),
            next_timer_ident: Cell::new(0),
            stopped: Cell::new(false),
        })
    }

    /// Submits a single change entry to the kqueue.
    fn kevent_change(&self, ident: usize, filter: i16, flags: u16, data: isize) -> io::Result<()> {
        let change = libc::kevent {
            ident,
            filter,
            flags,
            fflags: 0,
            data,
            udata: ptr::null_mut(),
        };

        let rc = unsafe { libc::kevent(self.kq, &change, 1, ptr::null_mut(), 0, ptr::null()) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Creates a read or write watch on a descriptor.
    fn watch_io(&self, fd: RawFd, write: bool, callback: WatchCallback) -> io::Result<WatchHandle> {
        let table = if write { &self.writes } else { &self.reads };

        if table.borrow().contains_key(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "descriptor already watched for this direction",
            ));
        }

        let entry = if write {
            WatchEntry::Write { fd, callback }
        } else {
            WatchEntry::Read { fd, callback }
        };
        let token = self.watches.borrow_mut().insert(entry);

        let filter = if write { EVFILT_WRITE } else { EVFILT_READ };
        if let Err(err) = self.kevent_change(fd as usize, filter, EV_ADD, 0) {
            self.watches.borrow_mut().remove(token);
            return Err(err);
        }

        table.borrow_mut().insert(fd, token);
        Ok(WatchHandle::new(token))
    }

    /// Returns the callback stored under a token, if the watch is live
    /// and of the kind the filter reports.
    ///
    /// Looked up per event rather than ahead of the pass, because an
    /// earlier callback of the same pass may have cancelled the watch.
    /// The kind check rejects a stale event whose token has since been
    /// reused by a watch of a different kind.
    fn callback_for(&self, token: usize, filter: i16) -> Option<WatchCallback> {
        let watches = self.watches.borrow();
        let callback = match (watches.get(token)?, filter) {
            (WatchEntry::Read { callback, .. }, EVFILT_READ) => callback,
            (WatchEntry::Write { callback, .. }, EVFILT_WRITE) => callback,
            (WatchEntry::Signal { callback, .. }, EVFILT_SIGNAL) => callback,
            (WatchEntry::Timer { callback, .. }, EVFILT_TIMER) => callback,
            _ => return None,
        };
        Some(callback.clone())
    }

    /// Dispatches one kevent to the watch it belongs to.
    fn dispatch(&self, ident: usize, filter: i16) {
        let token = match filter {
            EVFILT_READ => self.reads.borrow().get(&(ident as RawFd)).copied(),
            EVFILT_WRITE => self.writes.borrow().get(&(ident as RawFd)).copied(),
            EVFILT_SIGNAL => self.signals.borrow().get(&(ident as c_int)).copied(),
            EVFILT_TIMER => self.timers.borrow().get(&ident).copied(),
            _ => None,
        };

        let Some(token) = token else { return };
        if let Some(callback) = self.callback_for(token, filter) {
            callback();
        }
    }
}

impl Backend for KqueueBackend {
    fn watch_read(&self, fd: RawFd, callback: WatchCallback) -> io::Result<WatchHandle> {
        self.watch_io(fd, false, callback)
    }

    fn watch_write(&self, fd: RawFd, callback: WatchCallback) -> io::Result<WatchHandle> {
        self.watch_io(fd, true, callback)
    }

    fn watch_signal(&self, signal: c_int, callback: WatchCallback) -> io::Result<WatchHandle> {
        if self.signals.borrow().contains_key(&signal) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "signal already watched",
            ));
        }

        sys_ignore_signal(signal)?;

        let token = self
            .watches
            .borrow_mut()
            .insert(WatchEntry::Signal { signal, callback });

        if let Err(err) = self.kevent_change(signal as usize, EVFILT_SIGNAL, EV_ADD, 0) {
            self.watches.borrow_mut().remove(token);
            sys_default_signal(signal);
            return Err(err);
        }

        self.signals.borrow_mut().insert(signal, token);
        Ok(WatchHandle::new(token))
    }

    fn watch_timer(&self, period: Duration, callback: WatchCallback) -> io::Result<WatchHandle> {
        if period.is_zero() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "timer period must be non-zero",
            ));
        }

        let ident = self.next_timer_ident.get();
        self.next_timer_ident.set(ident + 1);

        let token = self
            .watches
            .borrow_mut()
            .insert(WatchEntry::Timer { ident, callback });

        // EVFILT_TIMER takes milliseconds by default; never arm at 0.
        let millis = period.as_millis().max(1) as isize;
        if let Err(err) = self.kevent_change(ident, EVFILT_TIMER, EV_ADD, millis) {
            self.watches.borrow_mut().remove(token);
            return Err(err);
        }

        self.timers.borrow_mut().insert(ident, token);
        Ok(WatchHandle::new(token))
    }

    fn cancel(&self, handle: WatchHandle) -> bool {
        let entry = self.watches.borrow_mut().remove(handle.token());
        let Some(entry) = entry else {
            return false;
        };

        match entry {
            WatchEntry::Read { fd, .. } => {
                self.reads.borrow_mut().remove(&fd);
                self.kevent_change(fd as usize, EVFILT_READ, EV_DELETE, 0)
                    .is_ok()
            }
            WatchEntry::Write { fd, .. } => {
                self.writes.borrow_mut().remove(&fd);
                self.kevent_change(fd as usize, EVFILT_WRITE, EV_DELETE, 0)
                    .is_ok()
            }
            WatchEntry::Signal { signal, .. } => {
                self.signals.borrow_mut().remove(&signal);
                let ok = self
                    .kevent_change(signal as usize, EVFILT_SIGNAL, EV_DELETE, 0)
                    .is_ok();
                sys_default_signal(signal);
                ok
            }
            WatchEntry::Timer { ident, .. } => {
                self.timers.borrow_mut().remove(&ident);
                self.kevent_change(ident, EVFILT_TIMER, EV_DELETE, 0).is_ok()
            }
        }
    }

    fn run(&self) -> io::Result<()> {
        self.stopped.set(false);

        let mut ready: Vec<libc::kevent> = Vec::with_capacity(64);

        loop {
            if self.stopped.get() || self.watches.borrow().is_empty() {
                break;
            }

            unsafe {
                ready.set_len(0);
            }

            let n = unsafe {
                libc::kevent(
                    self.kq,
                    ptr::null(),
                    0,
                    ready.as_mut_ptr(),
                    ready.capacity() as c_int,
                    ptr::null(),
                )
            };

            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }

            unsafe {
                ready.set_len(n as usize);
            }

            let fired: Vec<(usize, i16)> = ready.iter().map(|ev| (ev.ident, ev.filter)).collect();
            for (ident, filter) in fired {
                if self.stopped.get() {
                    break;
                }
                self.dispatch(ident, filter);
            }
        }

        self.stopped.set(false);
        Ok(())
    }

    fn stop(&self) {
        self.stopped.set(true);
    }
}

impl Drop for KqueueBackend {
    /// Closes the kqueue and restores the disposition of every watched
    /// signal.
    fn drop(&mut self) {
        for &signal in self.signals.get_mut().keys() {
            sys_default_signal(signal);
        }

        sys_close(self.kq);
    }
}
