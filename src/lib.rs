//! # Rota
//!
//! **Rota** is a single-threaded callback reactor: one loop thread
//! dispatching descriptor readiness, POSIX signal delivery, and timer
//! expirations to registered callbacks.
//!
//! Unlike a full async runtime, Rota has no tasks, no buffering, and no
//! thread pool. It is the thin layer real servers are built on: you
//! register interest, the loop tells you when something happened, and
//! everything runs cooperatively on one thread.
//!
//! Event detection is delegated to a [`Backend`] chosen by the caller:
//!
//! - [`backend::EpollBackend`] on Linux (`epoll` + `signalfd`),
//! - [`backend::KqueueBackend`] on macOS (`kqueue` filters),
//!
//! with [`backend::OsBackend`] naming the native one for the target.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rota::{OsBackend, Reactor};
//! use std::time::Duration;
//!
//! let reactor = Reactor::new(OsBackend::new()?);
//!
//! reactor.add_interval(Duration::from_secs(1), |id| {
//!     println!("tick {id}");
//! })?;
//!
//! reactor.add_timeout(Duration::from_secs(5), {
//!     let reactor = reactor.clone();
//!     move |_| reactor.stop()
//! })?;
//!
//! reactor.run()?;
//! ```
//!
//! ## Semantics
//!
//! - Read, write, signal, and interval registrations are persistent;
//!   timeouts fire once and remove themselves before their callback
//!   runs.
//! - Registering a key that is already registered replaces the old
//!   watch; removing a key that is not registered returns `false`.
//! - Timer ids are unique for the lifetime of the reactor, across both
//!   timer kinds, and are never reused.
//! - A panic escaping any callback terminates the process with exit
//!   status [`CALLBACK_FAULT_EXIT`].
//!
//! Everything is single-threaded and Unix-only.

mod utils;

pub mod backend;
pub mod reactor;

pub use backend::{Backend, WatchCallback, WatchHandle};
pub use reactor::{CALLBACK_FAULT_EXIT, Reactor, TimerId};

#[cfg(any(target_os = "linux", target_os = "macos"))]
pub use backend::OsBackend;
