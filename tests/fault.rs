#![cfg(any(target_os = "linux", target_os = "macos"))]

//! Fault-policy tests.
//!
//! A panic escaping a callback must terminate the process with exit
//! status 250, for every event kind. Each test re-executes this test
//! binary filtered down to itself; the child branch drives the reactor
//! into the fault and the parent asserts on the exit status.

use rota::{CALLBACK_FAULT_EXIT, OsBackend, Reactor};

use std::env;
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::process::{Command, Stdio};
use std::time::Duration;

const CHILD_ENV: &str = "ROTA_FAULT_CHILD";

fn spawn_child(test_name: &str) -> Option<i32> {
    let status = Command::new(env::current_exe().unwrap())
        .arg("--exact")
        .arg(test_name)
        .env(CHILD_ENV, "1")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .expect("failed to re-execute the test binary");

    status.code()
}

#[test]
fn panicking_timer_callback_is_fatal() {
    if env::var_os(CHILD_ENV).is_some() {
        let reactor = Reactor::new(OsBackend::new().unwrap());
        reactor
            .add_timeout(Duration::from_millis(10), |_| panic!("callback fault"))
            .unwrap();
        let _ = reactor.run();

        // The fault policy must have exited already.
        std::process::exit(1);
    }

    assert_eq!(
        spawn_child("panicking_timer_callback_is_fatal"),
        Some(CALLBACK_FAULT_EXIT),
        "a panicking timeout callback must exit with the fault status"
    );
}

#[test]
fn panicking_signal_callback_is_fatal() {
    if env::var_os(CHILD_ENV).is_some() {
        let reactor = Reactor::new(OsBackend::new().unwrap());
        reactor
            .add_signal(libc::SIGUSR1, |_| panic!("callback fault"))
            .unwrap();

        // Raise from the loop thread once it is running.
        reactor
            .add_timeout(Duration::from_millis(10), move |_| {
                unsafe { libc::raise(libc::SIGUSR1) };
            })
            .unwrap();
        let _ = reactor.run();

        std::process::exit(1);
    }

    assert_eq!(
        spawn_child("panicking_signal_callback_is_fatal"),
        Some(CALLBACK_FAULT_EXIT),
        "a panicking signal callback must exit with the fault status"
    );
}

#[test]
fn panicking_read_callback_is_fatal() {
    if env::var_os(CHILD_ENV).is_some() {
        let (mut writer, receiver) = UnixStream::pair().unwrap();
        receiver.set_nonblocking(true).unwrap();

        let reactor = Reactor::new(OsBackend::new().unwrap());
        reactor
            .add_read(receiver.as_raw_fd(), |_| panic!("callback fault"))
            .unwrap();

        writer.write_all(&[1]).unwrap();
        let _ = reactor.run();

        std::process::exit(1);
    }

    assert_eq!(
        spawn_child("panicking_read_callback_is_fatal"),
        Some(CALLBACK_FAULT_EXIT),
        "a panicking read callback must exit with the fault status"
    );
}
