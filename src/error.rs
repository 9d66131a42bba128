//! Error and deadline vocabulary. See `SPEC_FULL.md` §7.

use std::fmt;
use std::io;
use std::time::Duration;

/// A point in time to fire a timeout at, on the loop's own clock (see
/// `EventLoop::time`).
#[derive(Debug, Clone, Copy)]
pub enum Deadline {
    /// Absolute seconds on the loop's clock.
    At(f64),
    /// Relative to the moment `add_timeout` is called.
    After(Duration),
}

/// Everything that can go wrong calling into the loop, short of a user
/// callback panicking (which is caught and logged, never propagated here).
///
/// No `thiserror`: nothing in this crate's dependency lineage pulls in an
/// error-derive macro, so `Error`/`Display` are implemented by hand, same
/// as the teacher does for its own `io::Result`-returning APIs.
#[derive(Debug)]
pub enum EventLoopError {
    /// `start()` called while the loop is already running.
    AlreadyRunning,
    /// `start()` called from a process that is not the one that
    /// constructed the loop (i.e. after a `fork()`).
    ForkedProcess,
    /// A loop-thread-only operation was invoked from another thread.
    WrongThread,
    /// `close()` called while the loop is still running.
    StillRunning,
    /// `run_sync`'s deadline elapsed before the supplied function returned.
    Timeout,
    /// An underlying OS call failed.
    Io(io::Error),
}

impl fmt::Display for EventLoopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventLoopError::AlreadyRunning => write!(f, "event loop is already running"),
            EventLoopError::ForkedProcess => {
                write!(f, "event loop used from a process other than the one that created it")
            }
            EventLoopError::WrongThread => {
                write!(f, "operation only valid on the loop's owning thread")
            }
            EventLoopError::StillRunning => write!(f, "close() called while the loop is running"),
            EventLoopError::Timeout => write!(f, "timed out waiting for run_sync to complete"),
            EventLoopError::Io(err) => write!(f, "io error: {}", err),
        }
    }
}

impl std::error::Error for EventLoopError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EventLoopError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for EventLoopError {
    fn from(err: io::Error) -> EventLoopError {
        EventLoopError::Io(err)
    }
}

/// Extracts a human-readable message from a caught `catch_unwind` payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
