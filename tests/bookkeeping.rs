//! Registry-protocol tests against a scripted in-memory backend.
//!
//! The backend records every call it receives, so these tests can pin
//! down the reactor's bookkeeping: the replace policy, timer-id
//! allocation, one-shot auto-removal ordering, and teardown.

use rota::{Backend, Reactor, WatchCallback, WatchHandle};

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Call {
    WatchRead(RawFd),
    WatchWrite(RawFd),
    WatchSignal(libc::c_int),
    WatchTimer(u64),
    Cancel(usize),
    Stop,
}

/// In-memory backend that records calls and fires watches on demand.
#[derive(Default)]
struct ScriptedBackend {
    calls: RefCell<Vec<Call>>,
    watches: RefCell<HashMap<usize, WatchCallback>>,
    next_token: Cell<usize>,
}

impl ScriptedBackend {
    fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    fn mint(&self, callback: WatchCallback) -> WatchHandle {
        let token = self.next_token.get();
        self.next_token.set(token + 1);
        self.watches.borrow_mut().insert(token, callback);
        WatchHandle::new(token)
    }

    /// Handle of the most recently created watch.
    fn last_handle(&self) -> WatchHandle {
        WatchHandle::new(self.next_token.get() - 1)
    }

    /// Invokes the callback of a live watch, as the OS would.
    fn fire(&self, handle: WatchHandle) {
        let callback = self.watches.borrow().get(&handle.token()).cloned();
        if let Some(callback) = callback {
            callback();
        }
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }
}

impl Backend for ScriptedBackend {
    fn watch_read(&self, fd: RawFd, callback: WatchCallback) -> io::Result<WatchHandle> {
        self.calls.borrow_mut().push(Call::WatchRead(fd));
        Ok(self.mint(callback))
    }

    fn watch_write(&self, fd: RawFd, callback: WatchCallback) -> io::Result<WatchHandle> {
        self.calls.borrow_mut().push(Call::WatchWrite(fd));
        Ok(self.mint(callback))
    }

    fn watch_signal(&self, signal: libc::c_int, callback: WatchCallback) -> io::Result<WatchHandle> {
        self.calls.borrow_mut().push(Call::WatchSignal(signal));
        Ok(self.mint(callback))
    }

    fn watch_timer(&self, period: Duration, callback: WatchCallback) -> io::Result<WatchHandle> {
        self.calls
            .borrow_mut()
            .push(Call::WatchTimer(period.as_millis() as u64));
        Ok(self.mint(callback))
    }

    fn cancel(&self, handle: WatchHandle) -> bool {
        self.calls.borrow_mut().push(Call::Cancel(handle.token()));
        self.watches.borrow_mut().remove(&handle.token()).is_some()
    }

    fn run(&self) -> io::Result<()> {
        Ok(())
    }

    fn stop(&self) {
        self.calls.borrow_mut().push(Call::Stop);
    }
}

#[test]
fn remove_read_then_remove_again_returns_false() {
    let backend = ScriptedBackend::new();
    let reactor = Reactor::new(backend.clone());

    reactor.add_read(7, |_| {}).unwrap();

    assert!(reactor.remove_read(7), "first removal should succeed");
    assert!(
        !reactor.remove_read(7),
        "second removal must be a no-op returning false"
    );
}

#[test]
fn reregistering_read_cancels_previous_watch_first() {
    let backend = ScriptedBackend::new();
    let reactor = Reactor::new(backend.clone());

    reactor.add_read(3, |_| {}).unwrap();
    let first = backend.last_handle();

    reactor.add_read(3, |_| {}).unwrap();

    assert_eq!(
        backend.calls(),
        vec![
            Call::WatchRead(3),
            Call::Cancel(first.token()),
            Call::WatchRead(3),
        ],
        "old watch must be cancelled before the new one is created"
    );
}

#[test]
fn remove_operations_are_independent_per_kind() {
    let backend = ScriptedBackend::new();
    let reactor = Reactor::new(backend.clone());

    reactor.add_read(4, |_| {}).unwrap();
    reactor.add_write(4, |_| {}).unwrap();
    reactor.add_signal(10, |_| {}).unwrap();

    assert!(!reactor.remove_signal(4), "fd 4 is not a watched signal");
    assert!(reactor.remove_write(4));
    assert!(reactor.remove_read(4));
    assert!(reactor.remove_signal(10));
}

#[test]
fn timer_ids_are_distinct_across_removals() {
    let backend = ScriptedBackend::new();
    let reactor = Reactor::new(backend.clone());

    let a = reactor.add_timeout(Duration::from_millis(5), |_| {}).unwrap();
    assert!(reactor.remove_timer(a));

    let b = reactor.add_interval(Duration::from_millis(5), |_| {}).unwrap();
    let c = reactor.add_timeout(Duration::from_millis(5), |_| {}).unwrap();

    assert_ne!(a, b, "removed id must not be reused");
    assert_ne!(b, c);
    assert_ne!(a, c);
}

#[test]
fn timeout_is_removed_before_its_callback_runs() {
    let backend = ScriptedBackend::new();
    let reactor = Reactor::new(backend.clone());

    let observed = Rc::new(Cell::new(None));

    let id = reactor
        .add_timeout(Duration::from_millis(5), {
            let reactor = reactor.clone();
            let observed = observed.clone();
            move |id| observed.set(Some(reactor.remove_timer(id)))
        })
        .unwrap();
    let handle = backend.last_handle();

    backend.fire(handle);

    assert_eq!(
        observed.get(),
        Some(false),
        "the entry must already be gone when the callback runs"
    );
    assert!(
        !reactor.remove_timer(id),
        "expired timeout must stay removed"
    );
    assert!(
        backend.calls().contains(&Call::Cancel(handle.token())),
        "backend watch must be cancelled on expiry"
    );
}

#[test]
fn interval_entry_survives_firing() {
    let backend = ScriptedBackend::new();
    let reactor = Reactor::new(backend.clone());

    let count = Rc::new(Cell::new(0));

    let id = reactor
        .add_interval(Duration::from_millis(5), {
            let count = count.clone();
            move |_| count.set(count.get() + 1)
        })
        .unwrap();
    let handle = backend.last_handle();

    backend.fire(handle);
    backend.fire(handle);
    assert_eq!(count.get(), 2);

    assert!(reactor.remove_timer(id));
    backend.fire(handle);
    assert_eq!(count.get(), 2, "no firing after removal");
}

#[test]
fn timeout_firing_can_reregister_inside_callback() {
    let backend = ScriptedBackend::new();
    let reactor = Reactor::new(backend.clone());

    let replacement = Rc::new(Cell::new(None));

    reactor
        .add_timeout(Duration::from_millis(5), {
            let reactor = reactor.clone();
            let replacement = replacement.clone();
            move |_| {
                let id = reactor
                    .add_timeout(Duration::from_millis(5), |_| {})
                    .unwrap();
                replacement.set(Some(id));
            }
        })
        .unwrap();
    let handle = backend.last_handle();

    backend.fire(handle);

    let id = replacement.get().expect("callback should have registered");
    assert!(
        reactor.remove_timer(id),
        "replacement registered inside the callback must be live"
    );
}

#[test]
fn validation_rejects_input_before_backend() {
    let backend = ScriptedBackend::new();
    let reactor = Reactor::new(backend.clone());

    let err = reactor.add_read(-1, |_| {}).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

    let err = reactor.add_write(-5, |_| {}).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

    let err = reactor.add_signal(0, |_| {}).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

    let err = reactor.add_interval(Duration::ZERO, |_| {}).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

    let err = reactor.add_timeout(Duration::ZERO, |_| {}).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

    assert!(
        backend.calls().is_empty(),
        "validation failures must not reach the backend"
    );
}

#[test]
fn dropping_the_reactor_cancels_every_live_watch() {
    let backend = ScriptedBackend::new();

    {
        let reactor = Reactor::new(backend.clone());
        reactor.add_read(1, |_| {}).unwrap();
        reactor.add_write(2, |_| {}).unwrap();
        reactor.add_signal(12, |_| {}).unwrap();
        reactor.add_interval(Duration::from_millis(5), |_| {}).unwrap();
    }

    let cancels = backend
        .calls()
        .iter()
        .filter(|call| matches!(call, Call::Cancel(_)))
        .count();
    assert_eq!(cancels, 4, "teardown must cancel each registered watch");
    assert!(
        backend.watches.borrow().is_empty(),
        "no backend watch may outlive the reactor"
    );
}
