//! Notification backends.
//!
//! A backend is the facility that actually detects events: descriptor
//! readiness, signal delivery, and elapsed time. The reactor core is
//! written against the [`Backend`] trait and never against a concrete
//! polling mechanism, so alternate backends can be substituted by the
//! composition root.
//!
//! Two backends ship with the crate, selected by target OS:
//! - [`EpollBackend`] on Linux (`epoll` + `signalfd` + a deadline heap),
//! - [`KqueueBackend`] on macOS (`kqueue` filters for all four kinds).
//!
//! The [`OsBackend`] alias names the native backend for the current
//! platform; the caller still constructs it explicitly and hands it to
//! the reactor.

pub(crate) mod sys;

#[cfg(target_os = "linux")]
mod epoll;

#[cfg(target_os = "linux")]
mod event;

#[cfg(target_os = "linux")]
mod timer;

#[cfg(target_os = "macos")]
mod kqueue;

#[cfg(target_os = "linux")]
pub use epoll::EpollBackend;

#[cfg(target_os = "macos")]
pub use kqueue::KqueueBackend;

/// The native backend for the current platform.
#[cfg(target_os = "linux")]
pub type OsBackend = EpollBackend;

/// The native backend for the current platform.
#[cfg(target_os = "macos")]
pub type OsBackend = KqueueBackend;

use libc::c_int;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

/// Callback type handed to a backend when creating a watch.
///
/// The backend invokes it every time the watched event fires. It is
/// reference-counted so the backend can release its live-watch tables
/// before calling into user code.
pub type WatchCallback = Rc<dyn Fn()>;

/// Opaque token identifying one active watch inside a backend.
///
/// The reactor stores the handle returned by a `watch_*` call and uses
/// it for exactly one [`Backend::cancel`] later. Handles from one
/// backend instance are meaningless to any other instance.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct WatchHandle(usize);

impl WatchHandle {
    /// Creates a handle from a backend-chosen token.
    ///
    /// Only [`Backend`] implementations should mint handles.
    pub fn new(token: usize) -> Self {
        Self(token)
    }

    /// Returns the backend-chosen token inside this handle.
    pub fn token(&self) -> usize {
        self.0
    }
}

/// Capability contract of an event-notification backend.
///
/// All watches are persistent: they keep firing until cancelled. The
/// reactor builds one-shot semantics on top by cancelling a timer watch
/// itself. Creating a watch also arms it; there is no separate
/// activation step.
///
/// Backends are single-threaded: every method, including the callbacks
/// invoked from [`run`](Backend::run), executes on the loop thread.
pub trait Backend {
    /// Watches a descriptor for readability.
    ///
    /// Fails with [`io::ErrorKind::AlreadyExists`] if the descriptor
    /// already has a read watch; replacing a watch is the reactor's
    /// job, not the backend's.
    fn watch_read(&self, fd: RawFd, callback: WatchCallback) -> io::Result<WatchHandle>;

    /// Watches a descriptor for writability.
    ///
    /// Same duplicate rule as [`watch_read`](Backend::watch_read).
    fn watch_write(&self, fd: RawFd, callback: WatchCallback) -> io::Result<WatchHandle>;

    /// Watches for delivery of an OS signal.
    ///
    /// While the watch is active the signal's normal disposition is
    /// suppressed; cancelling restores it.
    fn watch_signal(&self, signal: c_int, callback: WatchCallback) -> io::Result<WatchHandle>;

    /// Creates a repeating timer firing every `period`.
    ///
    /// `period` must be non-zero.
    fn watch_timer(&self, period: Duration, callback: WatchCallback) -> io::Result<WatchHandle>;

    /// Cancels a watch.
    ///
    /// Returns `false` if the handle no longer names an active watch.
    /// Once this returns `true`, the callback will not fire again.
    fn cancel(&self, handle: WatchHandle) -> bool;

    /// Runs the blocking dispatch loop.
    ///
    /// Returns when [`stop`](Backend::stop) is called or when no active
    /// watches remain. The only error surfaced is a non-`EINTR` failure
    /// of the underlying poll syscall.
    fn run(&self) -> io::Result<()>;

    /// Requests loop termination.
    ///
    /// Safe to call from within a callback; the loop exits once the
    /// current dispatch pass completes, without invoking the remaining
    /// callbacks of that pass.
    fn stop(&self);
}

impl<B: Backend> Backend for Rc<B> {
    fn watch_read(&self, fd: RawFd, callback: WatchCallback) -> io::Result<WatchHandle> {
        (**self).watch_read(fd, callback)
    }

    fn watch_write(&self, fd: RawFd, callback: WatchCallback) -> io::Result<WatchHandle> {
        (**self).watch_write(fd, callback)
    }

    fn watch_signal(&self, signal: c_int, callback: WatchCallback) -> io::Result<WatchHandle> {
        (**self).watch_signal(signal, callback)
    }

    fn watch_timer(&self, period: Duration, callback: WatchCallback) -> io::Result<WatchHandle> {
        (**self).watch_timer(period, callback)
    }

    fn cancel(&self, handle: WatchHandle) -> bool {
        (**self).cancel(handle)
    }

    fn run(&self) -> io::Result<()> {
        (**self).run()
    }

    fn stop(&self) {
        (**self).stop()
    }
}
