use crate::errors::FailureClass;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use tokio::time::Instant;

/// A node parked until a later instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryEntry {
    /// Index of the node in the submission.
    pub node: usize,
    /// Earliest instant the node may run again.
    pub next_eligible: Instant,
    /// Retry count for the entry's class.
    pub attempt: u32,
    /// Why the node was parked.
    pub class: FailureClass,
    seq: u64,
}

impl Ord for RetryEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the max-heap pops the earliest entry first.
        other
            .next_eligible
            .cmp(&self.next_eligible)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for RetryEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of parked nodes keyed by eligibility time.
#[derive(Debug, Default)]
pub struct RetryQueue {
    heap: BinaryHeap<RetryEntry>,
    seq: u64,
}

impl RetryQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks a node. Entries with equal times pop in insertion order.
    pub fn push(&mut self, node: usize, next_eligible: Instant, attempt: u32, class: FailureClass) {
        self.seq += 1;
        self.heap.push(RetryEntry {
            node,
            next_eligible,
            attempt,
            class,
            seq: self.seq,
        });
    }

    /// Pops the earliest entry if it is eligible at `now`.
    pub fn pop_ready(&mut self, now: Instant) -> Option<RetryEntry> {
        if self.heap.peek()?.next_eligible <= now {
            self.heap.pop()
        } else {
            None
        }
    }

    /// Returns the earliest eligibility time.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.next_eligible)
    }

    /// Returns the number of parked nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Removes every parked entry, earliest first.
    pub fn drain(&mut self) -> Vec<RetryEntry> {
        let mut entries: Vec<RetryEntry> = self.heap.drain().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries
    }

    /// Returns true if nothing is parked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
