//! End-to-end reactor scenarios, mirroring SPEC_FULL.md §8.
//!
//! Callback and handler closures must be `Send` (`Callback`/`Handler`'s
//! definitions), so none of them capture the `Rc<EventLoop>` directly —
//! they call `EventLoop::current()` once they're actually running on the
//! loop thread, the same pattern `periodic.rs` uses internally.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use reel_loop::{Deadline, EventLoop, Ready};
use serial_test::serial;

fn init_logger() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::try_init();
    });
}

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

/// Scenario 1: a single immediate callback records and stops the loop.
#[test]
#[serial]
fn immediate_callback_runs_once_then_stops() {
    init_logger();
    EventLoop::clear_current();
    let event_loop = EventLoop::new().unwrap();
    let trace = Arc::new(Mutex::new(Vec::new()));

    let trace2 = trace.clone();
    event_loop.add_callback(move || {
        trace2.lock().unwrap().push("a");
        EventLoop::current().stop();
    });

    event_loop.start().unwrap();
    assert_eq!(*trace.lock().unwrap(), vec!["a"]);
}

/// Scenario 2: two timers at the same deadline fire in enqueue order.
#[test]
#[serial]
fn ordered_timers_break_ties_by_sequence() {
    init_logger();
    EventLoop::clear_current();
    let event_loop = EventLoop::new().unwrap();
    let trace = Arc::new(Mutex::new(Vec::new()));

    let trace_a = trace.clone();
    event_loop.add_timeout(
        Deadline::After(Duration::from_millis(50)),
        Box::new(move || trace_a.lock().unwrap().push("A")),
    );
    let trace_b = trace.clone();
    event_loop.add_timeout(
        Deadline::After(Duration::from_millis(50)),
        Box::new(move || trace_b.lock().unwrap().push("B")),
    );

    event_loop.add_timeout(
        Deadline::After(Duration::from_millis(100)),
        Box::new(|| EventLoop::current().stop()),
    );

    event_loop.start().unwrap();
    assert_eq!(*trace.lock().unwrap(), vec!["A", "B"]);
}

/// Scenario 3: cancelling a timer before it fires means it never runs.
#[test]
#[serial]
fn cancelled_timer_never_runs() {
    init_logger();
    EventLoop::clear_current();
    let event_loop = EventLoop::new().unwrap();
    let fired = Arc::new(AtomicBool::new(false));

    let fired2 = fired.clone();
    let handle = event_loop.add_timeout(
        Deadline::After(Duration::from_millis(50)),
        Box::new(move || fired2.store(true, Ordering::SeqCst)),
    );

    event_loop.add_timeout(
        Deadline::After(Duration::from_millis(10)),
        Box::new(move || EventLoop::current().remove_timeout(handle)),
    );

    event_loop.add_timeout(
        Deadline::After(Duration::from_millis(100)),
        Box::new(|| EventLoop::current().stop()),
    );

    event_loop.start().unwrap();
    assert!(!fired.load(Ordering::SeqCst));
}

/// Scenario 4: a callback pushed from another thread wakes an otherwise
/// idle loop within about 100ms.
#[test]
#[serial]
fn cross_thread_add_callback_wakes_the_loop() {
    init_logger();
    EventLoop::clear_current();
    let event_loop = EventLoop::new().unwrap();
    let remote = event_loop.remote();
    let trace = Arc::new(Mutex::new(Vec::new()));

    let trace2 = trace.clone();
    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        remote.add_callback(move || {
            trace2.lock().unwrap().push("x");
            EventLoop::current().stop();
        });
    });

    event_loop.start().unwrap();
    handle.join().unwrap();
    assert_eq!(*trace.lock().unwrap(), vec!["x"]);
}

/// Scenario 5: a readiness handler fires while registered and stops firing
/// once removed.
#[test]
#[serial]
fn readiness_dispatch_and_removal() {
    init_logger();
    EventLoop::clear_current();
    let event_loop = EventLoop::new().unwrap();
    let (read_fd, write_fd) = nonblocking_pipe();
    let hits = Arc::new(AtomicUsize::new(0));

    let hits2 = hits.clone();
    event_loop
        .add_handler(
            read_fd,
            Box::new(move |fd, events| {
                assert!(events.is_readable());
                let mut buf = [0u8; 8];
                unsafe { libc::read(fd, buf.as_mut_ptr() as *mut _, buf.len()) };
                hits2.fetch_add(1, Ordering::SeqCst);
                let current = EventLoop::current();
                current.remove_handler(fd).unwrap();
                current.stop();
            }),
            Ready::readable(),
        )
        .unwrap();

    unsafe { libc::write(write_fd, b"x".as_ptr() as *const _, 1) };

    event_loop.start().unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    unsafe {
        libc::close(read_fd);
        libc::close(write_fd);
    }
}

/// A handler that reaches back into the loop to re-register itself (rather
/// than just removing itself, as scenario 5 does) must not panic on the
/// re-entrant `HandlerTable` borrow.
#[test]
#[serial]
fn handler_can_update_its_own_mask_from_inside_itself() {
    init_logger();
    EventLoop::clear_current();
    let event_loop = EventLoop::new().unwrap();
    let (read_fd, write_fd) = nonblocking_pipe();
    let hits = Arc::new(AtomicUsize::new(0));

    let hits2 = hits.clone();
    event_loop
        .add_handler(
            read_fd,
            Box::new(move |fd, _events| {
                let mut buf = [0u8; 8];
                unsafe { libc::read(fd, buf.as_mut_ptr() as *mut _, buf.len()) };
                let n = hits2.fetch_add(1, Ordering::SeqCst);
                let current = EventLoop::current();
                if n == 0 {
                    // Re-entrant mutation from inside the handler itself.
                    current.update_handler(fd, Ready::readable()).unwrap();
                } else {
                    current.remove_handler(fd).unwrap();
                    current.stop();
                }
            }),
            Ready::readable(),
        )
        .unwrap();

    unsafe {
        libc::write(write_fd, b"a".as_ptr() as *const _, 1);
        libc::write(write_fd, b"b".as_ptr() as *const _, 1);
    }

    event_loop.start().unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    unsafe {
        libc::close(read_fd);
        libc::close(write_fd);
    }
}

/// `stop()` called before `start()` is sticky: `start()` must return
/// immediately (clearing the flag) rather than entering the loop and
/// blocking for `POLL_CAP`.
#[test]
#[serial]
fn stop_before_start_returns_immediately() {
    init_logger();
    EventLoop::clear_current();
    let event_loop = EventLoop::new().unwrap();

    event_loop.stop();

    let started = std::time::Instant::now();
    event_loop.start().unwrap();
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "start() after a pre-emptive stop() must return immediately, took {:?}",
        started.elapsed()
    );

    // The sticky flag was cleared, so a normal run now behaves normally.
    let ran = Arc::new(AtomicBool::new(false));
    let ran2 = ran.clone();
    event_loop.add_callback(move || {
        ran2.store(true, Ordering::SeqCst);
        EventLoop::current().stop();
    });
    event_loop.start().unwrap();
    assert!(ran.load(Ordering::SeqCst));
}

/// Scenario 6: a self-re-enqueueing callback runs exactly once per
/// iteration and does not starve a timer scheduled for the first iteration.
#[test]
#[serial]
fn self_enqueueing_callback_does_not_starve_timers() {
    init_logger();
    EventLoop::clear_current();
    let event_loop = EventLoop::new().unwrap();
    let callback_runs = Arc::new(AtomicUsize::new(0));
    let timer_fired = Arc::new(AtomicBool::new(false));

    // `Callback` is `Box<dyn FnOnce() + Send>`, so the recursive slot is an
    // `Arc<Mutex<..>>`, not an `Rc<RefCell<..>>`; nothing it captures names
    // the `Rc<EventLoop>` directly.
    type Requeue = Arc<Mutex<Option<Box<dyn Fn() + Send>>>>;
    let slot: Requeue = Arc::new(Mutex::new(None));

    let slot2 = slot.clone();
    let runs = callback_runs.clone();
    *slot.lock().unwrap() = Some(Box::new(move || {
        runs.fetch_add(1, Ordering::SeqCst);
        let slot3 = slot2.clone();
        EventLoop::current().add_callback(move || (slot3.lock().unwrap().as_ref().unwrap())());
    }));
    (slot.lock().unwrap().as_ref().unwrap())();

    let fired2 = timer_fired.clone();
    event_loop.add_timeout(
        Deadline::After(Duration::from_millis(0)),
        Box::new(move || {
            fired2.store(true, Ordering::SeqCst);
            EventLoop::current().stop();
        }),
    );

    event_loop.start().unwrap();

    assert!(timer_fired.load(Ordering::SeqCst));
    // The self-enqueueing callback got at least one, but not unbounded, turns.
    assert!(callback_runs.load(Ordering::SeqCst) >= 1);
}
