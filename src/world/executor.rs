//! Per-rank task queue.
//!
//! Ready tasks are tagged with the priority computed by the owning
//! template's priomap. Higher priorities pop first; within one priority
//! submissions pop in FIFO order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Mutex;

pub(crate) struct Job {
    prio: i32,
    seq: u64,
    run: Box<dyn FnOnce() + Send>,
}

impl Job {
    pub(crate) fn run(self) {
        (self.run)()
    }
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.prio == other.prio && self.seq == other.seq
    }
}

impl Eq for Job {}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Job {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority wins, then the earlier submission.
        self.prio
            .cmp(&other.prio)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
pub(crate) struct TaskQueue {
    heap: Mutex<BinaryHeap<Job>>,
    next_seq: AtomicU64,
}

impl TaskQueue {
    pub(crate) fn push(&self, prio: i32, run: Box<dyn FnOnce() + Send>) {
        let seq = self.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.heap.lock().unwrap().push(Job { prio, seq, run });
    }

    pub(crate) fn try_pop(&self) -> Option<Job> {
        self.heap.lock().unwrap().pop()
    }
}
