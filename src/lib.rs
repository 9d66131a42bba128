//! A single-threaded, level-triggered I/O event loop.
//!
//! `reel-loop` multiplexes readiness notifications for many file
//! descriptors and dispatches time-based and immediate callbacks from one
//! owning thread. It is infrastructure: an [`EventLoop`] owns a readiness
//! poller (`epoll` on Linux, a `poll(2)`-based fallback elsewhere), a
//! min-heap of deferred timeouts, a FIFO of immediate callbacks, and a
//! cross-thread/signal-safe wake mechanism, and sequences them with
//! fairness and correctness invariants documented in `SPEC_FULL.md`.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use reel_loop::EventLoop;
//!
//! let event_loop = EventLoop::new().unwrap();
//! let remote = event_loop.remote();
//!
//! event_loop.call_later(
//!     Duration::from_millis(0),
//!     Box::new(move || remote.add_callback(|| {})),
//! );
//! event_loop.call_later(Duration::from_millis(10), Box::new(|| {}));
//!
//! // Closures scheduled on an `EventLoop` must be `Send`, so they look up
//! // the loop with `EventLoop::current()` once they're actually running on
//! // its thread rather than capturing the (non-`Send`) `Rc<EventLoop>`.
//! event_loop.call_later(
//!     Duration::from_millis(20),
//!     Box::new(|| EventLoop::current().stop()),
//! );
//! event_loop.start().unwrap();
//! ```

/// Executes a libc call that signals failure by returning `-1`, turning it
/// into an `io::Result`. Must be defined before `mod sys` (and every module
/// that uses it) since macros are resolved in textual order.
macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

mod callback;
mod error;
mod handler;
mod periodic;
mod poller;
mod queue;
mod reactor;
mod ready;
mod sys;
mod timer;
mod waker;

pub use callback::Callback;
pub use error::{Deadline, EventLoopError};
pub use handler::{split_fd, Handler};
pub use periodic::PeriodicCallback;
pub use reactor::{EventLoop, EventLoopBuilder, Remote};
pub use ready::Ready;
pub use timer::TimeoutHandle;

/// Event mask bit constants, the public ABI exposed to handler code
/// (`SPEC_FULL.md` §6). Prefer the [`Ready`] builders (`Ready::readable()`,
/// …) when constructing masks; these mirror the raw numeric values.
pub mod mask {
    /// Readiness to read without blocking.
    pub const READ: usize = 0b0001;
    /// Readiness to write without blocking.
    pub const WRITE: usize = 0b0010;
    /// `ERROR | HUP`, always implied on every registration.
    pub const ERROR: usize = 0b0100 | 0b1000;
}
