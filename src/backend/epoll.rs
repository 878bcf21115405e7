//! Linux `epoll`-based notification backend.
//!
//! Responsibilities:
//! - Watch descriptors for read/write readiness through `epoll`
//! - Route watched signals through per-signal `signalfd`s
//! - Drive timer watches from a deadline queue bounding the poll timeout
//! - Dispatch callbacks for everything that fired in a poll pass
//!
//! One descriptor has at most one epoll registration; read and write
//! watches on the same descriptor share it with merged interest flags.
//! Watch handles are slab tokens, and slab occupancy decides when the
//! loop runs out of work.

use super::event::Event;
use super::sys::{sys_block_signal, sys_close, sys_signalfd, sys_unblock_signal};
use super::timer::TimerEntry;
use super::{Backend, WatchCallback, WatchHandle};
use crate::utils::Slab;

use libc::{
    EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD, EPOLLERR, EPOLLHUP, EPOLLIN,
    EPOLLOUT, c_int, epoll_create1, epoll_ctl, epoll_event, epoll_wait,
};
use std::cell::{Cell, RefCell};
use std::collections::{BinaryHeap, HashMap};
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// One active watch, stored under its slab token.
enum WatchEntry {
    /// Read-readiness watch on a descriptor.
    Read { fd: RawFd, callback: WatchCallback },

    /// Write-readiness watch on a descriptor.
    Write { fd: RawFd, callback: WatchCallback },

    /// Signal watch, backed by a dedicated `signalfd`.
    Signal {
        sfd: RawFd,
        signal: c_int,
        callback: WatchCallback,
    },

    /// Timer watch; the firing state lives in the deadline queue.
    Timer { cancelled: Rc<Cell<bool>> },
}

/// Epoll interest currently registered for one descriptor.
///
/// Holds the slab tokens of the read and write watches sharing the
/// registration.
#[derive(Clone, Copy, Default)]
struct IoInterest {
    read: Option<usize>,
    write: Option<usize>,
}

/// Linux `epoll` notification backend.
///
/// Single-threaded: all watch mutation and every callback run on the
/// thread calling [`run`](Backend::run).
pub struct EpollBackend {
    /// Epoll file descriptor.
    epoll: RawFd,

    /// Live-watch table; tokens double as watch handles.
    watches: RefCell<Slab<WatchEntry>>,

    /// Per-descriptor epoll registration state.
    ios: RefCell<HashMap<RawFd, IoInterest>>,

    /// Maps each `signalfd` back to its watch token.
    signals: RefCell<HashMap<RawFd, usize>>,

    /// Pending timer firings, earliest deadline first.
    timers: RefCell<BinaryHeap<TimerEntry>>,

    /// Set by [`stop`](Backend::stop); checked between callbacks.
    stopped: Cell<bool>,
}

impl EpollBackend {
    /// Creates a new backend with a fresh epoll instance.
    pub fn new() -> io::Result<Self> {
        let epoll = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        if epoll < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            epoll,
            watches: RefCell::new(Slab::new(64)),
            ios: RefCell::new(HashMap::new()),
            signals: RefCell::new(HashMap::new()),
            timers: RefCell::new(BinaryHeap::new()),
            stopped: Cell::new(false),
        })
    }

    /// Applies the merged interest of a descriptor to epoll.
    fn epoll_update(&self, op: c_int, fd: RawFd, interest: IoInterest) -> io::Result<()> {
        let mut flags = 0;

        if interest.read.is_some() {
            flags |= EPOLLIN;
        }
        if interest.write.is_some() {
            flags |= EPOLLOUT;
        }

        let mut event = epoll_event {
            events: flags as u32,
            u64: fd as u64,
        };

        let rc = unsafe { epoll_ctl(self.epoll, op, fd, &mut event) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Creates a read or write watch on a descriptor.
    fn watch_io(&self, fd: RawFd, write: bool, callback: WatchCallback) -> io::Result<WatchHandle> {
        let entry = if write {
            WatchEntry::Write { fd, callback }
        } else {
            WatchEntry::Read { fd, callback }
        };
        let token = self.watches.borrow_mut().insert(entry);

        let mut ios = self.ios.borrow_mut();
        let interest = ios.entry(fd).or_default();

        let occupied = if write { interest.write } else { interest.read };
        if occupied.is_some() {
            drop(ios);
            self.watches.borrow_mut().remove(token);
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "descriptor already watched for this direction",
            ));
        }

        let first = interest.read.is_none() && interest.write.is_none();
        if write {
            interest.write = Some(token);
        } else {
            interest.read = Some(token);
        }
        let merged = *interest;

        let op = if first { EPOLL_CTL_ADD } else { EPOLL_CTL_MOD };
        if let Err(err) = self.epoll_update(op, fd, merged) {
            if let Some(interest) = ios.get_mut(&fd) {
                if write {
                    interest.write = None;
                } else {
                    interest.read = None;
                }
                if interest.read.is_none() && interest.write.is_none() {
                    ios.remove(&fd);
                }
            }
            drop(ios);
            self.watches.borrow_mut().remove(token);
            return Err(err);
        }

        Ok(WatchHandle::new(token))
    }

    /// Drops one direction of a descriptor's registration.
    fn cancel_io(&self, fd: RawFd, write: bool) -> bool {
        let remaining = {
            let mut ios = self.ios.borrow_mut();
            let Some(interest) = ios.get_mut(&fd) else {
                return false;
            };

            if write {
                interest.write = None;
            } else {
                interest.read = None;
            }

            if interest.read.is_none() && interest.write.is_none() {
                ios.remove(&fd);
                None
            } else {
                Some(*interest)
            }
        };

        match remaining {
            None => {
                let rc = unsafe { epoll_ctl(self.epoll, EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
                rc == 0
            }
            Some(interest) => self.epoll_update(EPOLL_CTL_MOD, fd, interest).is_ok(),
        }
    }

    /// Returns the callback of the live watch for one direction of a
    /// descriptor, if any.
    ///
    /// Looked up per event rather than ahead of the pass, because an
    /// earlier callback of the same pass may have cancelled the watch.
    fn io_callback(&self, fd: RawFd, write: bool) -> Option<WatchCallback> {
        let token = {
            let ios = self.ios.borrow();
            let interest = ios.get(&fd)?;
            let token = if write { interest.write } else { interest.read };
            token?
        };

        let watches = self.watches.borrow();
        match watches.get(token) {
            Some(WatchEntry::Read { callback, .. }) | Some(WatchEntry::Write { callback, .. }) => {
                Some(callback.clone())
            }
            _ => None,
        }
    }

    /// Dispatches one folded readiness event.
    fn dispatch(&self, event: Event) {
        let signal_token = self.signals.borrow().get(&event.fd).copied();
        if let Some(token) = signal_token {
            self.dispatch_signal(event.fd, token);
            return;
        }

        if event.readable {
            if let Some(callback) = self.io_callback(event.fd, false) {
                callback();
            }
        }

        if event.writable && !self.stopped.get() {
            if let Some(callback) = self.io_callback(event.fd, true) {
                callback();
            }
        }
    }

    /// Drains a ready `signalfd`, invoking the watch callback once per
    /// delivered signal.
    fn dispatch_signal(&self, sfd: RawFd, token: usize) {
        let callback = {
            let watches = self.watches.borrow();
            match watches.get(token) {
                Some(WatchEntry::Signal { callback, .. }) => callback.clone(),
                _ => return,
            }
        };

        let size = std::mem::size_of::<libc::signalfd_siginfo>();
        loop {
            // The callback may have cancelled this watch; the fd is
            // closed then, so stop draining.
            if !self.signals.borrow().contains_key(&sfd) {
                break;
            }

            let mut info: libc::signalfd_siginfo = unsafe { std::mem::zeroed() };
            let n = unsafe { libc::read(sfd, &mut info as *mut _ as *mut libc::c_void, size) };
            if n != size as isize {
                break;
            }

            callback();

            if self.stopped.get() {
                break;
            }
        }
    }

    /// Whether a signal already has a live watch.
    ///
    /// Keyed through the `signalfd` map because two watches on one
    /// signal would fight over its blocked mask.
    fn signal_watched(&self, signal: c_int) -> bool {
        let watches = self.watches.borrow();
        self.signals.borrow().values().any(|&token| {
            matches!(
                watches.get(token),
                Some(WatchEntry::Signal { signal: s, .. }) if *s == signal
            )
        })
    }

    /// Time until the earliest live deadline, if any timer is pending.
    ///
    /// Cancelled entries reaching the front are discarded here.
    fn next_timeout(&self) -> Option<Duration> {
        let mut timers = self.timers.borrow_mut();

        while let Some(entry) = timers.peek() {
            if entry.cancelled.get() {
                timers.pop();
            } else {
                break;
            }
        }

        timers
            .peek()
            .map(|entry| entry.deadline.saturating_duration_since(Instant::now()))
    }

    /// Fires every timer due by now, re-arming the survivors.
    fn fire_timers(&self) {
        let now = Instant::now();

        loop {
            if self.stopped.get() {
                break;
            }

            let due = {
                let mut timers = self.timers.borrow_mut();
                match timers.peek() {
                    Some(entry) if entry.deadline <= now => timers.pop(),
                    _ => None,
                }
            };
            let Some(timer) = due else { break };

            if timer.cancelled.get() {
                continue;
            }

            (timer.callback)();

            // The callback may have cancelled its own watch.
            if !timer.cancelled.get() {
                self.timers.borrow_mut().push(TimerEntry {
                    deadline: now + timer.period,
                    ..timer
                });
            }
        }
    }
}

impl Backend for EpollBackend {
    fn watch_read(&self, fd: RawFd, callback: WatchCallback) -> io::Result<WatchHandle> {
        self.watch_io(fd, false, callback)
    }

    fn watch_write(&self, fd: RawFd, callback: WatchCallback) -> io::Result<WatchHandle> {
        self.watch_io(fd, true, callback)
    }

    fn watch_signal(&self, signal: c_int, callback: WatchCallback) -> io::Result<WatchHandle> {
        if self.signal_watched(signal) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "signal already watched",
            ));
        }

        sys_block_signal(signal)?;

        let sfd = match sys_signalfd(signal) {
            Ok(fd) => fd,
            Err(err) => {
                let _ = sys_unblock_signal(signal);
                return Err(err);
            }
        };

        let mut event = epoll_event {
            events: EPOLLIN as u32,
            u64: sfd as u64,
        };
        let rc = unsafe { epoll_ctl(self.epoll, EPOLL_CTL_ADD, sfd, &mut event) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            sys_close(sfd);
            let _ = sys_unblock_signal(signal);
            return Err(err);
        }

        let token = self.watches.borrow_mut().insert(WatchEntry::Signal {
            sfd,
            signal,
            callback,
        });
        self.signals.borrow_mut().insert(sfd, token);

        Ok(WatchHandle::new(token))
    }

    fn watch_timer(&self, period: Duration, callback: WatchCallback) -> io::Result<WatchHandle> {
        if period.is_zero() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "timer period must be non-zero",
            ));
        }

        let cancelled = Rc::new(Cell::new(false));
        let token = self.watches.borrow_mut().insert(WatchEntry::Timer {
            cancelled: cancelled.clone(),
        });

        self.timers.borrow_mut().push(TimerEntry {
            deadline: Instant::now() + period,
            period,
            callback,
            cancelled,
        });

        Ok(WatchHandle::new(token))
    }

    fn cancel(&self, handle: WatchHandle) -> bool {
        let entry = self.watches.borrow_mut().remove(handle.token());
        let Some(entry) = entry else {
            return false;
        };

        match entry {
            WatchEntry::Read { fd, .. } => self.cancel_io(fd, false),
            WatchEntry::Write { fd, .. } => self.cancel_io(fd, true),
            WatchEntry::Signal { sfd, signal, .. } => {
                self.signals.borrow_mut().remove(&sfd);
                let rc = unsafe { epoll_ctl(self.epoll, EPOLL_CTL_DEL, sfd, std::ptr::null_mut()) };
                sys_close(sfd);
                let _ = sys_unblock_signal(signal);
                rc == 0
            }
            WatchEntry::Timer { cancelled } => {
                cancelled.set(true);
                true
            }
        }
    }

    fn run(&self) -> io::Result<()> {
        self.stopped.set(false);

        let mut ready: Vec<epoll_event> = Vec::with_capacity(64);
        let mut events: Vec<Event> = Vec::new();

        loop {
            if self.stopped.get() || self.watches.borrow().is_empty() {
                break;
            }

            // Round up so a deadline just under the next millisecond
            // does not turn the wait into a busy poll.
            let timeout_ms = self
                .next_timeout()
                .map(|t| t.as_nanos().div_ceil(1_000_000).min(i32::MAX as u128) as i32)
                .unwrap_or(-1);

            unsafe {
                ready.set_len(0);
            }

            let n = unsafe {
                epoll_wait(
                    self.epoll,
                    ready.as_mut_ptr(),
                    ready.capacity() as i32,
                    timeout_ms,
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

            events.clear();
            for ev in &ready {
                let fd = ev.u64 as RawFd;
                let readable = ev.events & ((EPOLLIN | EPOLLERR | EPOLLHUP) as u32) != 0;
                let writable = ev.events & (EPOLLOUT as u32) != 0;

                if let Some(event) = events.iter_mut().find(|event| event.fd == fd) {
                    event.readable |= readable;
                    event.writable |= writable;
                } else {
                    events.push(Event {
                        fd,
                        readable,
                        writable,
                    });
                }
            }

            for event in events.drain(..) {
                if self.stopped.get() {
                    break;
                }
                self.dispatch(event);
            }

            self.fire_timers();
        }

        self.stopped.set(false);
        Ok(())
    }

    fn stop(&self) {
        self.stopped.set(true);
    }
}

impl Drop for EpollBackend {
    /// Closes the epoll instance and every live `signalfd`, restoring
    /// the blocked signals.
    fn drop(&mut self) {
        let watches = self.watches.get_mut();
        for (&sfd, &token) in self.signals.get_mut().iter() {
            if let Some(WatchEntry::Signal { signal, .. }) = watches.get(token) {
                let _ = sys_unblock_signal(*signal);
            }
            sys_close(sfd);
        }

        sys_close(self.epoll);
    }
}
