//! Monotonic timer wheel backing `Reactor::setup_timer`/`cancel_timer`.
//!
//! Timers fire at-or-after their deadline; ties are broken by insertion
//! order, matching the spec's ordering guarantee for identical deadlines.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

/// Opaque handle returned by [`super::Reactor::setup_timer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(pub(crate) u64);

pub(crate) type TimerCallback = Box<dyn FnOnce()>;

struct Entry {
    deadline: Instant,
    seq: u64,
    id: u64,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for Entry {}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse so BinaryHeap (a max-heap) pops the earliest deadline first.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
pub(crate) struct TimerWheel {
    heap: BinaryHeap<Entry>,
    callbacks: std::collections::HashMap<u64, TimerCallback>,
    next_id: u64,
    next_seq: u64,
}

impl TimerWheel {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn setup(&mut self, now: Instant, delay: Duration, cb: TimerCallback) -> TimerHandle {
        let id = self.next_id;
        self.next_id += 1;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry {
            deadline: now + delay,
            seq,
            id,
        });
        self.callbacks.insert(id, cb);
        TimerHandle(id)
    }

    pub(crate) fn cancel(&mut self, handle: TimerHandle) {
        // Lazily removed: the stale heap entry is skipped in `drain_due`
        // once its callback is gone.
        self.callbacks.remove(&handle.0);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.deadline)
    }

    /// Pops and returns the callbacks for every timer due at or before `now`.
    pub(crate) fn drain_due(&mut self, now: Instant) -> Vec<TimerCallback> {
        let mut due = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.deadline > now {
                break;
            }
            let entry = self.heap.pop().unwrap();
            if let Some(cb) = self.callbacks.remove(&entry.id) {
                due.push(cb);
            }
        }
        due
    }
}
