use std::os::unix::io::RawFd;

/// Readiness reported for one descriptor during a poll pass.
///
/// Read and write readiness for the same descriptor are folded into a
/// single record before dispatch.
pub(crate) struct Event {
    /// Descriptor the readiness applies to.
    pub(crate) fd: RawFd,

    /// Data can be read without blocking (or the peer hung up).
    pub(crate) readable: bool,

    /// Data can be written without blocking.
    pub(crate) writable: bool,
}
