//! Min-heap of pending timeouts. See `SPEC_FULL.md` §4.3.
//!
//! Built on `std::collections::BinaryHeap`, which is a max-heap, using the
//! same inverted-`Ord` trick the teacher's abandoned `plus::timer::Task`
//! sketched: flip `Ord` so the heap's max element is the earliest deadline.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::callback::Callback;

/// The cancellation cell shared between a [`TimeoutHandle`] and the heap
/// entry it names. `Mutex` (rather than `RefCell`) so the handle stays
/// `Send` — callbacks that cancel a timer are themselves `Send` closures
/// (see `tests/reactor.rs`'s cancellation scenario) even though the cell is
/// only ever touched from the loop thread in practice.
type Slot = Arc<Mutex<Option<Callback>>>;

/// Opaque handle returned by [`TimerHeap::push`], sufficient to [`TimerHeap::cancel`]
/// the timer it names. Cancellation writes directly into the shared cell
/// rather than searching the heap for a matching identity, matching
/// Tornado's `_Timeout` object whose `callback` attribute is cleared in
/// place by `remove_timeout`.
#[derive(Clone)]
pub struct TimeoutHandle {
    slot: Slot,
    deadline: f64,
    sequence: u64,
}

impl fmt::Debug for TimeoutHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutHandle")
            .field("deadline", &self.deadline)
            .field("sequence", &self.sequence)
            .finish()
    }
}

struct Entry {
    deadline: f64,
    sequence: u64,
    slot: Slot,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Entry) -> bool {
        self.deadline == other.deadline && self.sequence == other.sequence
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Entry) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    /// Inverted: a smaller deadline (or, on a tie, a smaller sequence)
    /// compares as *greater*, so `BinaryHeap`'s max-first pop yields the
    /// earliest-deadline, earliest-enqueued entry.
    fn cmp(&self, other: &Entry) -> Ordering {
        match self
            .deadline
            .partial_cmp(&other.deadline)
            .unwrap_or(Ordering::Equal)
        {
            Ordering::Equal => other.sequence.cmp(&self.sequence),
            ord => ord.reverse(),
        }
    }
}

/// A due timer handed back by [`TimerHeap::pop_due`].
pub struct DueTimer {
    pub handle: TimeoutHandle,
    pub callback: Callback,
}

/// Threshold from the teacher's `DESIGN NOTES`: random removal from a
/// binary heap is O(n), so the heap itself is only ever compacted in a
/// batch once dead entries dominate it; a single cancellation never
/// touches heap position, only the shared cell (see [`TimerHeap::cancel`]).
const COMPACT_COUNT_THRESHOLD: usize = 512;

#[derive(Default)]
pub struct TimerHeap {
    entries: BinaryHeap<Entry>,
    next_sequence: u64,
    cancelled: usize,
}

impl TimerHeap {
    pub fn new() -> TimerHeap {
        TimerHeap {
            entries: BinaryHeap::new(),
            next_sequence: 0,
            cancelled: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Deadline of the earliest live-or-dead entry, if any.
    pub fn peek_deadline(&self) -> Option<f64> {
        self.entries.peek().map(|e| e.deadline)
    }

    pub fn push(&mut self, deadline: f64, callback: Callback) -> TimeoutHandle {
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let slot: Slot = Arc::new(Mutex::new(Some(callback)));
        self.entries.push(Entry {
            deadline,
            sequence,
            slot: slot.clone(),
        });
        TimeoutHandle {
            slot,
            deadline,
            sequence,
        }
    }

    /// Clears the callback for `handle` if it is still live. O(1): this
    /// writes directly into the cell shared with the heap entry, never
    /// searching or rebuilding the heap. A no-op if the timer has already
    /// fired or was already cancelled. The dead entry stays in the heap
    /// until [`TimerHeap::pop_due`] reaches it or [`TimerHeap::compact_if_needed`]
    /// reclaims it in a batch.
    pub fn cancel(&mut self, handle: TimeoutHandle) {
        if handle.slot.lock().unwrap().take().is_some() {
            self.cancelled += 1;
        }
    }

    /// Drains due entries: cancelled entries encountered at the top are
    /// discarded (and counted off), live entries with `deadline <= now`
    /// are popped and returned in order; stops at the first live entry
    /// whose deadline is still in the future.
    pub fn pop_due(&mut self, now: f64) -> Vec<DueTimer> {
        let mut due = Vec::new();

        loop {
            let top_is_cancelled = match self.entries.peek() {
                None => break,
                Some(top) => top.slot.lock().unwrap().is_none(),
            };
            if top_is_cancelled {
                self.entries.pop();
                self.cancelled = self.cancelled.saturating_sub(1);
                continue;
            }

            let top_is_due = matches!(self.entries.peek(), Some(top) if top.deadline <= now);
            if !top_is_due {
                break;
            }

            let entry = self.entries.pop().expect("peeked Some above");
            let callback = entry
                .slot
                .lock()
                .unwrap()
                .take()
                .expect("checked live above");
            let handle = TimeoutHandle {
                slot: entry.slot,
                deadline: entry.deadline,
                sequence: entry.sequence,
            };
            due.push(DueTimer { handle, callback });
        }

        due
    }

    /// Reclaims dead slots once they dominate the heap, per §4.3's rule.
    pub fn compact_if_needed(&mut self) {
        if self.cancelled > COMPACT_COUNT_THRESHOLD && self.cancelled > self.entries.len() / 2 {
            let live: BinaryHeap<Entry> = std::mem::take(&mut self.entries)
                .into_iter()
                .filter(|e| e.slot.lock().unwrap().is_some())
                .collect();
            self.entries = live;
            self.cancelled = 0;
        }
    }
}
