//! Timer heap entries.

use std::cmp::Ordering;
use std::time::Instant;

use super::Callback;

/// A callback scheduled for a deadline.
///
/// Ordered so that a `BinaryHeap<Timer>` pops the earliest deadline first;
/// equal deadlines fire in the order they were scheduled.
pub(crate) struct Timer {
    pub deadline: Instant,
    pub seq: u64,
    pub callback: Callback,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
