//! The readiness poller: a thin, backend-agnostic wrapper over the platform
//! selector (`epoll` on Linux, `poll(2)` elsewhere). See `SPEC_FULL.md` §4.1.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use log::debug;

use crate::ready::Ready;
use crate::sys;

const DEFAULT_CAPACITY: usize = 1024;

/// Level-triggered readiness multiplexer used internally by [`EventLoop`].
///
/// [`EventLoop`]: crate::EventLoop
pub(crate) struct Poller {
    sys: sys::Selector,
    events: sys::Events,
}

impl Poller {
    pub fn new() -> io::Result<Poller> {
        Poller::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(cap: usize) -> io::Result<Poller> {
        Ok(Poller {
            sys: sys::Selector::new()?,
            events: sys::Events::with_capacity(cap),
        })
    }

    /// Registers `fd` for `mask`, with `ERROR | HUP` always implied.
    pub fn register(&mut self, fd: RawFd, mask: Ready) -> io::Result<()> {
        self.sys.add(fd, mask | Ready::error_and_hup())
    }

    pub fn modify(&mut self, fd: RawFd, mask: Ready) -> io::Result<()> {
        self.sys.modify(fd, mask | Ready::error_and_hup())
    }

    /// Unregisters `fd`. Tolerates the fd having already been closed
    /// out-of-band by the caller: the backend error is logged and swallowed.
    pub fn unregister(&mut self, fd: RawFd) {
        if let Err(err) = self.sys.delete(fd) {
            debug!("error deleting fd {} from poller: {}", fd, err);
        }
    }

    /// Blocks for up to `timeout` (`None` blocks forever) and returns the
    /// ready `(fd, mask)` pairs observed. A single call never retries on
    /// `EINTR` — that policy belongs to the reactor (`SPEC_FULL.md` §4.7
    /// step 8), which can tell an interrupted wait apart from a real error.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<(RawFd, Ready)>> {
        self.sys.wait(&mut self.events, timeout)?;
        Ok(self.events.iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn register_and_observe_readable_pipe() {
        let (r, mut w) = crate::waker::test_support::pipe().unwrap();
        let mut poller = Poller::new().unwrap();
        poller.register(r.as_raw_fd(), Ready::readable()).unwrap();

        let before = poller.poll(Some(Duration::from_millis(0))).unwrap();
        assert!(before.is_empty());

        use std::io::Write;
        w.write_all(b"x").unwrap();

        let after = poller.poll(Some(Duration::from_millis(200))).unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].0, r.as_raw_fd());
        assert!(after[0].1.is_readable());
    }

    #[test]
    fn unregister_already_closed_fd_does_not_panic() {
        let mut poller = Poller::new().unwrap();
        let (r, _w) = crate::waker::test_support::pipe().unwrap();
        let fd = r.as_raw_fd();
        poller.register(fd, Ready::readable()).unwrap();
        drop(r);
        poller.unregister(fd);
    }
}
