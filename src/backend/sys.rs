use libc::{c_int, close};
use std::io;
use std::os::unix::io::RawFd;

#[cfg(target_os = "linux")]
use libc::{SIG_BLOCK, SIG_UNBLOCK, sigaddset, sigemptyset, sigset_t};

/// Closes a file descriptor.
pub(crate) fn sys_close(fd: RawFd) {
    unsafe { close(fd) };
}

/// Builds a signal set containing exactly one signal.
#[cfg(target_os = "linux")]
fn sys_sigset(signal: c_int) -> sigset_t {
    unsafe {
        let mut set: sigset_t = std::mem::zeroed();
        sigemptyset(&mut set);
        sigaddset(&mut set, signal);
        set
    }
}

#[cfg(target_os = "linux")]
fn sys_mask_signal(signal: c_int, how: c_int) -> io::Result<()> {
    let set = sys_sigset(signal);

    let rc = unsafe { libc::pthread_sigmask(how, &set, std::ptr::null_mut()) };
    if rc != 0 {
        Err(io::Error::from_raw_os_error(rc))
    } else {
        Ok(())
    }
}

/// Blocks a signal on the calling thread.
///
/// Required before routing the signal through a descriptor-based
/// mechanism, otherwise default delivery wins.
#[cfg(target_os = "linux")]
pub(crate) fn sys_block_signal(signal: c_int) -> io::Result<()> {
    sys_mask_signal(signal, SIG_BLOCK)
}

/// Unblocks a signal on the calling thread, restoring default delivery.
#[cfg(target_os = "linux")]
pub(crate) fn sys_unblock_signal(signal: c_int) -> io::Result<()> {
    sys_mask_signal(signal, SIG_UNBLOCK)
}

/// Creates a non-blocking `signalfd` receiving exactly one signal.
#[cfg(target_os = "linux")]
pub(crate) fn sys_signalfd(signal: c_int) -> io::Result<RawFd> {
    let set = sys_sigset(signal);

    let fd = unsafe { libc::signalfd(-1, &set, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC) };
    if fd < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(fd)
    }
}

/// Sets a signal's disposition to ignore.
///
/// kqueue's `EVFILT_SIGNAL` observes delivery without consuming it, so
/// the default disposition must be suppressed while a watch is active.
#[cfg(target_os = "macos")]
pub(crate) fn sys_ignore_signal(signal: c_int) -> io::Result<()> {
    let previous = unsafe { libc::signal(signal, libc::SIG_IGN) };
    if previous == libc::SIG_ERR {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Restores a signal's default disposition.
#[cfg(target_os = "macos")]
pub(crate) fn sys_default_signal(signal: c_int) {
    unsafe { libc::signal(signal, libc::SIG_DFL) };
}
