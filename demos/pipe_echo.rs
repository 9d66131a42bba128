//! Registers a pipe's read end with the loop, writes to it from a second
//! thread on a short timer, and stops once the bytes have been echoed back.
//!
//! Run with `RUST_LOG=debug cargo run --example pipe_echo` (via the
//! `demos/` path configured in `Cargo.toml`) to see the `log::debug!`
//! call sites this crate wires up around handler removal.

use std::os::unix::io::RawFd;
use std::time::Duration;

use reel_loop::{EventLoop, Ready};

fn nonblocking_pipe() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(ret, 0);
    for fd in fds {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    }
    (fds[0], fds[1])
}

fn main() {
    env_logger::init();

    let event_loop = EventLoop::new().unwrap();
    let (read_fd, write_fd) = nonblocking_pipe();

    event_loop
        .add_handler(
            read_fd,
            Box::new(move |fd, events| {
                if !events.is_readable() {
                    return;
                }
                let mut buf = [0u8; 64];
                let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut _, buf.len()) };
                if n > 0 {
                    let text = String::from_utf8_lossy(&buf[..n as usize]);
                    println!("read {} bytes: {:?}", n, text);
                }
                let current = EventLoop::current();
                current.remove_handler(fd).unwrap();
                current.stop();
            }),
            Ready::readable(),
        )
        .unwrap();

    event_loop.call_later(
        Duration::from_millis(5),
        Box::new(move || {
            unsafe { libc::write(write_fd, b"hello from a timer".as_ptr() as *const _, 19) };
        }),
    );

    event_loop.start().unwrap();

    unsafe {
        libc::close(read_fd);
        libc::close(write_fd);
    }
}
