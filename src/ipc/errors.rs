//! Errors surfaced by the IPC primitives.

use std::error::Error;
use std::fmt::{self, Display};
use std::io;

/// A failed OS primitive, by operation name and native error code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OsError {
    /// The primitive that failed, e.g. `"shm_open"` or `"flock"`.
    pub op: &'static str,
    /// The native error code (`errno` or `GetLastError`).
    pub code: i32,
}

impl Display for OsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed, error: {}", self.op, self.code)
    }
}

impl Error for OsError {}

/// Everything that can go wrong in the IPC layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpcError {
    /// A non-owner tried to open a named resource that does not exist.
    ResourceMissing,
    /// The calling thread already holds the mutex.
    RecursiveLock,
    /// The calling thread tried to unlock a mutex it does not hold.
    NotOwner,
    /// An underlying OS primitive failed.
    Os(OsError),
}

impl Display for IpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpcError::ResourceMissing => write!(f, "named resource does not exist"),
            IpcError::RecursiveLock => write!(f, "mutex is already locked by this thread"),
            IpcError::NotOwner => write!(f, "mutex is not locked by this thread"),
            IpcError::Os(error) => error.fmt(f),
        }
    }
}

impl Error for IpcError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            IpcError::Os(error) => Some(error),
            _ => None,
        }
    }
}

impl From<OsError> for IpcError {
    fn from(error: OsError) -> Self {
        IpcError::Os(error)
    }
}

/// Wraps a known native error code.
pub(crate) fn os_error(op: &'static str, code: i32) -> IpcError {
    IpcError::Os(OsError { op, code })
}

/// Captures the thread's last OS error (`errno` on unix,
/// `GetLastError` on windows) for `op`.
pub(crate) fn last_os_error(op: &'static str) -> IpcError {
    os_error(op, errno())
}

/// The thread's last OS error code.
pub(crate) fn errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(-1)
}
