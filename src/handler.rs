//! Registered I/O handlers. See `SPEC_FULL.md` §4.5.

use std::os::unix::io::{AsRawFd, RawFd};

use indexmap::IndexMap;
use log::debug;
use slab::Slab;

use crate::poller::Poller;
use crate::ready::Ready;

/// `(fd, readiness)` handler invoked by the reactor on dispatch.
pub type Handler = Box<dyn FnMut(RawFd, Ready) + Send>;

struct HandlerEntry {
    fd: RawFd,
    /// `None` while a dispatch in progress has temporarily taken the
    /// handler out (see [`HandlerTable::take_handler`]); never observed
    /// `None` outside of that window.
    handler: Option<Handler>,
    mask: Ready,
    /// Retained only so `close(all_fds=true)` can close the underlying
    /// resource; the table itself never reads through this beyond its fd.
    owner: Option<Box<dyn AsRawFd + Send>>,
}

/// Maps registered fds to their handler, backed by a `slab::Slab` for O(1)
/// insert/remove and an `indexmap`-style `fd -> slab index` lookup — the
/// teacher's two dependencies, put to the use the plain `mio` selector
/// sidesteps only by keying everything on an opaque `Token` instead.
#[derive(Default)]
pub struct HandlerTable {
    by_fd: IndexMap<RawFd, usize>,
    entries: Slab<HandlerEntry>,
}

impl HandlerTable {
    pub fn new() -> HandlerTable {
        HandlerTable {
            by_fd: IndexMap::new(),
            entries: Slab::new(),
        }
    }

    /// Registers `fd`. An existing registration for the same fd is dropped
    /// first — callers are expected to `remove` before re-adding, matching
    /// `PollIOLoop.add_handler`'s silent dict overwrite.
    pub fn add(
        &mut self,
        poller: &mut Poller,
        fd: RawFd,
        handler: Handler,
        mask: Ready,
        owner: Option<Box<dyn AsRawFd + Send>>,
    ) -> std::io::Result<()> {
        if self.by_fd.contains_key(&fd) {
            self.remove(poller, fd);
        }

        poller.register(fd, mask)?;
        let index = self.entries.insert(HandlerEntry {
            fd,
            handler: Some(handler),
            mask,
            owner,
        });
        self.by_fd.insert(fd, index);
        Ok(())
    }

    pub fn update(&mut self, poller: &mut Poller, fd: RawFd, mask: Ready) -> std::io::Result<()> {
        poller.modify(fd, mask)?;
        if let Some(&index) = self.by_fd.get(&fd) {
            self.entries[index].mask = mask;
        }
        Ok(())
    }

    /// Removes `fd`'s registration. Backend errors (the fd may already be
    /// closed out from under the loop) are logged, not propagated.
    pub fn remove(&mut self, poller: &mut Poller, fd: RawFd) -> bool {
        match self.by_fd.shift_remove(&fd) {
            Some(index) => {
                self.entries.remove(index);
                poller.unregister(fd);
                true
            }
            None => {
                debug!("remove_handler called for unregistered fd {}", fd);
                false
            }
        }
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.by_fd.contains_key(&fd)
    }

    pub fn mask_of(&self, fd: RawFd) -> Option<Ready> {
        self.by_fd.get(&fd).map(|&i| self.entries[i].mask)
    }

    /// Invokes the handler for `fd` with `events` directly, if still
    /// registered. Returns `false` if the fd was removed before dispatch
    /// reached it (legal re-entrancy: a handler run earlier in the same
    /// batch may have called `remove`).
    ///
    /// Holds `&mut self` for the duration of the call, so the handler must
    /// not itself reach back into this table (no `add`/`update`/`remove`
    /// from inside). Suitable for tests and other direct callers; the
    /// reactor dispatches through [`HandlerTable::take_handler`] /
    /// [`HandlerTable::restore_handler`] instead, precisely so a handler
    /// *can* mutate the table re-entrantly (`SPEC_FULL.md` §4.7 step 9).
    pub fn dispatch(&mut self, fd: RawFd, events: Ready) -> bool {
        match self.by_fd.get(&fd).copied() {
            Some(index) => match self.entries[index].handler.as_mut() {
                Some(handler) => {
                    handler(fd, events);
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    /// Removes the handler closure for `fd` from its table slot and hands
    /// it back to the caller, along with the slab index the entry lives
    /// at, without retaining any borrow of `self`. Pair with
    /// [`HandlerTable::restore_handler`] once the handler has been invoked
    /// — the window between the two calls is exactly where a re-entrant
    /// `add_handler`/`update_handler`/`remove_handler` from inside the
    /// handler is safe to make.
    pub fn take_handler(&mut self, fd: RawFd) -> Option<(usize, Handler)> {
        let index = *self.by_fd.get(&fd)?;
        let handler = self.entries.get_mut(index)?.handler.take()?;
        Some((index, handler))
    }

    /// Returns a handler taken by [`HandlerTable::take_handler`] to its
    /// slot, unless `fd` was removed (or removed and re-added under a new
    /// slot) while the handler ran — in which case the handler is simply
    /// dropped, matching `remove_handler`'s "pending events discarded"
    /// contract for anything that happens mid-dispatch.
    pub fn restore_handler(&mut self, fd: RawFd, index: usize, handler: Handler) {
        if self.by_fd.get(&fd) == Some(&index) {
            if let Some(entry) = self.entries.get_mut(index) {
                entry.handler = Some(handler);
            }
        }
    }

    pub fn fds(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.by_fd.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Closes every retained owner and clears the table. Used by
    /// `EventLoop::close(all_fds = true)`.
    pub fn close_all(&mut self) {
        for (_, entry) in self.entries.iter_mut() {
            if let Some(owner) = entry.owner.take() {
                drop(owner);
            }
        }
        self.entries.clear();
        self.by_fd.clear();
    }
}

/// Splits an `AsRawFd`-like value into its raw fd plus a boxed handle
/// retained for later closing — the Rust equivalent of Tornado's duck-typed
/// `fd.fileno()` dispatch, which accepts either a raw fd or a file-like
/// object and remembers the object only to close it later.
pub fn split_fd<T>(source: T) -> (RawFd, Box<dyn AsRawFd + Send>)
where
    T: AsRawFd + Send + 'static,
{
    let fd = source.as_raw_fd();
    (fd, Box::new(source))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn add_then_dispatch_invokes_handler() {
        let mut poller = Poller::new().unwrap();
        let mut table = HandlerTable::new();
        let (r, _w) = crate::waker::test_support::pipe().unwrap();
        let fd = r.as_raw_fd();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits2 = hits.clone();
        table
            .add(
                &mut poller,
                fd,
                Box::new(move |_fd, _ready| {
                    hits2.fetch_add(1, Ordering::SeqCst);
                }),
                Ready::readable(),
                Some(Box::new(r)),
            )
            .unwrap();

        assert!(table.dispatch(fd, Ready::readable()));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_then_dispatch_is_a_noop() {
        let mut poller = Poller::new().unwrap();
        let mut table = HandlerTable::new();
        let (r, _w) = crate::waker::test_support::pipe().unwrap();
        let fd = r.as_raw_fd();

        table
            .add(&mut poller, fd, Box::new(|_, _| {}), Ready::readable(), None)
            .unwrap();
        assert!(table.remove(&mut poller, fd));
        assert!(!table.dispatch(fd, Ready::readable()));
    }

    #[test]
    fn duplicate_add_overwrites_prior_registration() {
        let mut poller = Poller::new().unwrap();
        let mut table = HandlerTable::new();
        let (r, _w) = crate::waker::test_support::pipe().unwrap();
        let fd = r.as_raw_fd();

        table
            .add(&mut poller, fd, Box::new(|_, _| {}), Ready::readable(), None)
            .unwrap();
        table
            .add(&mut poller, fd, Box::new(|_, _| {}), Ready::writable(), None)
            .unwrap();

        assert_eq!(table.len(), 1);
        assert_eq!(table.mask_of(fd), Some(Ready::writable()));
    }
}
