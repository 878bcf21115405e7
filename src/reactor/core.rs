use super::registry::{IoKind, Registry, TimerId, TimerSlot};
use crate::backend::{Backend, WatchCallback};

use libc::c_int;
use std::cell::{Cell, RefCell};
use std::io;
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::rc::{Rc, Weak};
use std::time::Duration;

/// Process exit status used when a user callback panics.
///
/// A panic escaping a callback leaves the loop mid-dispatch in a state
/// that cannot be trusted, so dispatch catches it and terminates the
/// process with this status instead of unwinding further.
pub const CALLBACK_FAULT_EXIT: i32 = 250;

/// Runs a user callback under the fault policy.
fn guard<F: FnOnce()>(callback: F) {
    if panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
        process::exit(CALLBACK_FAULT_EXIT);
    }
}

fn invalid(message: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, message)
}

/// A single-threaded callback reactor.
///
/// Callers register interest in descriptor readability or writability,
/// delivery of an OS signal, or timer expiration; the matching callback
/// is invoked on the loop thread when the event fires. Detection is
/// delegated to the injected [`Backend`]; the reactor owns the
/// registration tables, the timer-id lifecycle, and the dispatch
/// policies built on top.
///
/// `Reactor` is a cheap clone of a shared core, so callbacks can
/// capture a clone to stop the loop or change registrations from
/// inside a dispatch. A callback holding a clone keeps the core alive
/// until the callback itself is removed.
///
/// Everything is single-threaded: registrations, removals, and
/// callbacks all happen on the thread driving [`run`](Reactor::run).
/// Cross-thread use is out of contract.
///
/// # Examples
///
/// ```rust,ignore
/// let reactor = Reactor::new(EpollBackend::new()?);
///
/// let id = reactor.add_timeout(Duration::from_secs(1), {
///     let reactor = reactor.clone();
///     move |_| reactor.stop()
/// })?;
///
/// reactor.run()?;
/// ```
pub struct Reactor<B: Backend> {
    inner: Rc<Inner<B>>,
}

struct Inner<B: Backend> {
    backend: B,

    /// Registration tables; only touched from the loop thread.
    registry: RefCell<Registry>,

    /// Next timer id to hand out. Ids are never reused, so a stale id
    /// can never collide with a later registration.
    next_timer_id: Cell<TimerId>,
}

impl<B: Backend> Clone for Reactor<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<B: Backend + 'static> Reactor<B> {
    /// Creates a reactor over the given notification backend.
    ///
    /// The backend is chosen and constructed by the caller; the reactor
    /// never probes the environment for one.
    pub fn new(backend: B) -> Self {
        Self {
            inner: Rc::new(Inner {
                backend,
                registry: RefCell::new(Registry::default()),
                next_timer_id: Cell::new(1),
            }),
        }
    }

    /// Registers a callback for readability of a descriptor.
    ///
    /// The watch is persistent: the callback fires on every readable
    /// edge until [`remove_read`](Reactor::remove_read). Registering a
    /// descriptor that already has a read watch cancels the previous
    /// watch first.
    pub fn add_read(&self, fd: RawFd, callback: impl Fn(RawFd) + 'static) -> io::Result<()> {
        if fd < 0 {
            return Err(invalid("negative file descriptor"));
        }

        let guarded: WatchCallback = Rc::new(move || guard(|| callback(fd)));

        self.cancel_existing(IoKind::Read, fd);
        let handle = self.inner.backend.watch_read(fd, guarded)?;
        self.inner
            .registry
            .borrow_mut()
            .insert(IoKind::Read, fd, handle);

        Ok(())
    }

    /// Registers a callback for writability of a descriptor.
    ///
    /// Same persistence and replacement rules as
    /// [`add_read`](Reactor::add_read).
    pub fn add_write(&self, fd: RawFd, callback: impl Fn(RawFd) + 'static) -> io::Result<()> {
        if fd < 0 {
            return Err(invalid("negative file descriptor"));
        }

        let guarded: WatchCallback = Rc::new(move || guard(|| callback(fd)));

        self.cancel_existing(IoKind::Write, fd);
        let handle = self.inner.backend.watch_write(fd, guarded)?;
        self.inner
            .registry
            .borrow_mut()
            .insert(IoKind::Write, fd, handle);

        Ok(())
    }

    /// Registers a callback for delivery of an OS signal.
    ///
    /// Persistent until [`remove_signal`](Reactor::remove_signal);
    /// re-registering a watched signal replaces the previous watch.
    pub fn add_signal(&self, signal: c_int, callback: impl Fn(c_int) + 'static) -> io::Result<()> {
        if signal <= 0 {
            return Err(invalid("invalid signal number"));
        }

        let guarded: WatchCallback = Rc::new(move || guard(|| callback(signal)));

        self.cancel_existing(IoKind::Signal, signal);
        let handle = self.inner.backend.watch_signal(signal, guarded)?;
        self.inner
            .registry
            .borrow_mut()
            .insert(IoKind::Signal, signal, handle);

        Ok(())
    }

    /// Registers a repeating timer firing every `period`.
    ///
    /// The callback receives the returned timer id on every firing and
    /// keeps firing until [`remove_timer`](Reactor::remove_timer).
    pub fn add_interval(
        &self,
        period: Duration,
        callback: impl Fn(TimerId) + 'static,
    ) -> io::Result<TimerId> {
        self.add_timer(period, true, Rc::new(callback))
    }

    /// Registers a one-shot timer firing once after `delay`.
    ///
    /// The registration removes itself before the callback runs, so a
    /// callback re-registering sees no stale entry and
    /// [`remove_timer`](Reactor::remove_timer) on an expired id returns
    /// `false`.
    pub fn add_timeout(
        &self,
        delay: Duration,
        callback: impl Fn(TimerId) + 'static,
    ) -> io::Result<TimerId> {
        self.add_timer(delay, false, Rc::new(callback))
    }

    fn add_timer(
        &self,
        period: Duration,
        repeat: bool,
        callback: Rc<dyn Fn(TimerId)>,
    ) -> io::Result<TimerId> {
        if period.is_zero() {
            return Err(invalid("timer duration must be non-zero"));
        }

        let id = self.inner.next_timer_id.get();
        self.inner.next_timer_id.set(id + 1);

        // The backend has no notion of one-shot timers or timer ids;
        // it gets a trampoline into the dispatch logic instead of the
        // user callback.
        let weak = Rc::downgrade(&self.inner);
        let trampoline: WatchCallback = Rc::new(move || {
            if let Some(inner) = Weak::upgrade(&weak) {
                inner.dispatch_timer(id);
            }
        });

        let handle = self.inner.backend.watch_timer(period, trampoline)?;
        self.inner.registry.borrow_mut().insert_timer(
            id,
            TimerSlot {
                handle,
                repeat,
                callback,
            },
        );

        Ok(id)
    }

    /// Removes a read watch. Returns `false` if none exists.
    pub fn remove_read(&self, fd: RawFd) -> bool {
        self.remove_io(IoKind::Read, fd)
    }

    /// Removes a write watch. Returns `false` if none exists.
    pub fn remove_write(&self, fd: RawFd) -> bool {
        self.remove_io(IoKind::Write, fd)
    }

    /// Removes a signal watch. Returns `false` if none exists.
    pub fn remove_signal(&self, signal: c_int) -> bool {
        self.remove_io(IoKind::Signal, signal)
    }

    /// Removes an interval or timeout.
    ///
    /// Returns `false` if the id is unknown, already removed, or
    /// belonged to a timeout that has fired. Not an error: removal may
    /// race against expiry across nested dispatches.
    pub fn remove_timer(&self, id: TimerId) -> bool {
        let slot = self.inner.registry.borrow_mut().remove_timer(id);
        match slot {
            Some(slot) => self.inner.backend.cancel(slot.handle),
            None => false,
        }
    }

    fn remove_io(&self, kind: IoKind, key: c_int) -> bool {
        let handle = self.inner.registry.borrow_mut().remove(kind, key);
        match handle {
            Some(handle) => self.inner.backend.cancel(handle),
            None => false,
        }
    }

    fn cancel_existing(&self, kind: IoKind, key: c_int) {
        let previous = self.inner.registry.borrow_mut().remove(kind, key);
        if let Some(handle) = previous {
            self.inner.backend.cancel(handle);
        }
    }

    /// Runs the event loop on the calling thread.
    ///
    /// Blocks until [`stop`](Reactor::stop) is called or the backend
    /// runs out of active watches. The only error surfaced is a
    /// non-`EINTR` failure of the backend's poll.
    pub fn run(&self) -> io::Result<()> {
        self.inner.backend.run()
    }

    /// Stops the event loop.
    ///
    /// Safe to call from within a callback; `run` returns once the
    /// current dispatch pass completes, invoking no further callbacks
    /// from that pass.
    pub fn stop(&self) {
        self.inner.backend.stop()
    }
}

impl<B: Backend> Inner<B> {
    /// Dispatches a firing of timer `id`.
    ///
    /// One-shot slots are removed from the registry and their backend
    /// watch cancelled *before* the user callback runs, so the watch is
    /// released exactly once and a callback re-registering observes a
    /// clean slate. An unknown id (removed between two nested firings)
    /// is a no-op.
    fn dispatch_timer(&self, id: TimerId) {
        let fired = {
            let registry = self.registry.borrow();
            registry
                .timer(id)
                .map(|slot| (slot.callback.clone(), slot.repeat, slot.handle))
        };
        let Some((callback, repeat, handle)) = fired else {
            return;
        };

        if !repeat {
            self.registry.borrow_mut().remove_timer(id);
            self.backend.cancel(handle);
        }

        guard(|| callback(id));
    }
}

impl<B: Backend> Drop for Inner<B> {
    /// Cancels every watch still registered, so no backend resource
    /// outlives the reactor.
    fn drop(&mut self) {
        for handle in self.registry.get_mut().drain_handles() {
            self.backend.cancel(handle);
        }
    }
}
