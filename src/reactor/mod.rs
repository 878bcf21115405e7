//! Reactor core and dispatch.
//!
//! This module implements the bookkeeping half of the event loop:
//! - registration tables keyed by event kind and identity,
//! - the timer-id lifecycle and one-shot/repeating unification,
//! - the removal and teardown protocol,
//! - the callback-invocation contract, including the fault policy.
//!
//! Event detection itself lives behind the [`Backend`] trait in
//! [`crate::backend`]; the reactor translates registrations into
//! backend watches and records the resulting handles.
//!
//! [`Backend`]: crate::backend::Backend

mod core;
mod registry;

pub use self::core::{CALLBACK_FAULT_EXIT, Reactor};
pub use self::registry::TimerId;
