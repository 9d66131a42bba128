//! The immediate-callback queue. See `SPEC_FULL.md` §4.4.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use crate::queue::Queue;

/// A zero-argument, run-once unit of work scheduled onto the loop.
pub type Callback = Box<dyn FnOnce() + Send>;

/// Specializes the generic [`Queue`] to `Callback`, adding the
/// iteration-snapshot draining the reactor's fairness rule depends on.
///
/// Cloning shares the underlying queue (and its waker): this is how a
/// `Remote` handle reaches the same queue the reactor drains.
#[derive(Clone)]
pub struct CallbackQueue {
    inner: Queue<Callback>,
}

impl CallbackQueue {
    pub fn new() -> io::Result<CallbackQueue> {
        Ok(CallbackQueue {
            inner: Queue::unbounded()?,
        })
    }

    pub fn push(&self, callback: Callback) {
        // Unbounded: the only failure mode is a closed queue, which only
        // happens after the loop itself has been torn down.
        let _ = self.inner.push(callback);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Pops up to `n` callbacks from the head. Called with the count
    /// captured *before* any callback in this iteration has run, so a
    /// callback that re-enqueues itself cannot be drained in the same pass.
    pub fn drain_snapshot(&self, n: usize) -> Vec<Callback> {
        let mut drained = Vec::with_capacity(n);
        for _ in 0..n {
            match self.inner.pop() {
                Ok(callback) => drained.push(callback),
                Err(_) => break,
            }
        }
        drained
    }

    pub fn consume_wakeup(&self) -> io::Result<()> {
        self.inner.consume_wakeup()
    }

    pub fn wake(&self) -> io::Result<()> {
        self.inner.wake()
    }
}

impl AsRawFd for CallbackQueue {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn drain_snapshot_caps_at_the_requested_count() {
        let queue = CallbackQueue::new().unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let ran = ran.clone();
            queue.push(Box::new(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }));
        }

        let snapshot = queue.drain_snapshot(3);
        assert_eq!(snapshot.len(), 3);
        assert_eq!(queue.len(), 2);

        for cb in snapshot {
            cb();
        }
        assert_eq!(ran.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn self_enqueueing_callback_does_not_grow_the_same_snapshot() {
        let queue = CallbackQueue::new().unwrap();
        queue.push(Box::new(|| {}));

        let snapshot_len = queue.len();
        let snapshot = queue.drain_snapshot(snapshot_len);
        assert_eq!(snapshot.len(), 1);

        // Running the callback pushes a new one; it must not appear in
        // `snapshot` (already captured above).
        queue.push(Box::new(|| {}));
        assert_eq!(queue.len(), 1);
    }
}
