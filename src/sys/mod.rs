//! Platform glue. `epoll` backs the selector on Linux; everything else
//! (`poll`-based `select`-equivalent) falls back to `sys::poll_backend`.
//!
//! The `syscall!` macro used throughout this tree is defined at the crate
//! root (`lib.rs`), textually before `mod sys;`, so it is in scope here and
//! in every descendant module without an explicit import.

pub mod fd;

#[cfg(target_os = "linux")]
pub mod eventfd;

#[cfg(target_os = "linux")]
pub mod epoll;

#[cfg(not(target_os = "linux"))]
pub mod poll_backend;

#[cfg(target_os = "linux")]
pub use self::epoll::{Epoll as Selector, Events};

#[cfg(not(target_os = "linux"))]
pub use self::poll_backend::{PollBackend as Selector, Events};
