//! Portable selector fallback for non-Linux unix targets, built on `libc::poll`.
//!
//! This is the `select`-equivalent backend the spec allows when `epoll` is
//! unavailable. It is O(n) in the number of registered fds per wait, which
//! is the well known tradeoff of `poll(2)` versus `epoll`; it exists so the
//! reactor has a fallback rather than being Linux-only.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use libc::{c_int, POLLERR, POLLHUP, POLLIN, POLLOUT, POLLRDHUP};

use crate::ready::Ready;

pub struct PollBackend {
    fds: Vec<libc::pollfd>,
}

impl PollBackend {
    pub fn new() -> io::Result<PollBackend> {
        Ok(PollBackend { fds: Vec::new() })
    }

    pub fn wait(&self, evts: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let timeout = timeout
            .map(|to| std::cmp::min(to.as_millis(), c_int::MAX as u128) as c_int)
            .unwrap_or(-1);

        let mut fds = self.fds.clone();

        if fds.is_empty() {
            // `poll` with an empty set still blocks for `timeout`, giving us
            // the same idle-sleep behavior as epoll_wait on an empty set.
            if timeout < 0 {
                std::thread::park();
            } else {
                std::thread::sleep(Duration::from_millis(timeout.max(0) as u64));
            }
            evts.ready.clear();
            return Ok(());
        }

        syscall!(poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout))?;

        evts.ready.clear();
        for pfd in &fds {
            if pfd.revents != 0 {
                evts.ready.push((pfd.fd, revents_to_ready(pfd.revents)));
            }
        }

        Ok(())
    }

    pub fn add(&mut self, fd: RawFd, interests: Ready) -> io::Result<()> {
        self.fds.push(libc::pollfd {
            fd,
            events: ready_to_events(interests),
            revents: 0,
        });
        Ok(())
    }

    pub fn modify(&mut self, fd: RawFd, interests: Ready) -> io::Result<()> {
        if let Some(pfd) = self.fds.iter_mut().find(|pfd| pfd.fd == fd) {
            pfd.events = ready_to_events(interests);
        }
        Ok(())
    }

    pub fn delete(&mut self, fd: RawFd) -> io::Result<()> {
        self.fds.retain(|pfd| pfd.fd != fd);
        Ok(())
    }
}

fn ready_to_events(interest: Ready) -> i16 {
    let mut events = 0;

    if interest.is_readable() {
        events |= POLLIN;
    }

    if interest.is_writable() {
        events |= POLLOUT;
    }

    events as i16
}

fn revents_to_ready(revents: i16) -> Ready {
    let revents = revents as c_int;
    let mut kind = Ready::empty();

    if revents & POLLIN != 0 {
        kind |= Ready::readable();
    }

    if revents & POLLOUT != 0 {
        kind |= Ready::writable();
    }

    if revents & POLLERR != 0 {
        kind |= Ready::error();
    }

    if revents & (POLLHUP | POLLRDHUP) != 0 {
        kind |= Ready::hup();
    }

    kind
}

pub struct Events {
    ready: Vec<(RawFd, Ready)>,
}

impl Events {
    pub fn with_capacity(cap: usize) -> Events {
        Events {
            ready: Vec::with_capacity(cap),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ready.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (RawFd, Ready)> + '_ {
        self.ready.iter().copied()
    }
}
