//! Error taxonomy for the trace control plane (spec.md §7). Every fallible
//! operation returns `Result<T, IptError>`; nothing is retried locally.

/// Mirrors the external status-code space exactly, the way the teacher's
/// `utils::tests::QemuExitCode` pins a plain `repr` enum onto a host-defined
/// code space.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(i32)]
pub enum IptError {
    InvalidArgs = 1,
    BadState = 2,
    NoResources = 3,
    NoMemory = 4,
    NotSupported = 5,
    BufferTooSmall = 6,
    AlreadyBound = 7,
    Internal = 8,
}

pub type IptResult<T> = Result<T, IptError>;
