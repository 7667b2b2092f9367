//! Group routing strategies

use std::sync::Arc;

use parking_lot::Mutex;

use super::{GroupedQueue, Partition, TrackedQueue};
use crate::work::Groupable;

/// Decides which group a [`GroupedQueue`] serves next
///
/// Implementations see the partitions in discovery order. Returning a
/// partition whose queue has been emptied concurrently is allowed; the caller
/// treats it as "nothing available".
pub trait GroupRouter<T>: Send + Sync {
    /// Pick the group to serve and advance internal state
    fn next_partition(&self, queue: &GroupedQueue<T>) -> Option<Arc<TrackedQueue<T>>>;

    /// Pick the group that `next_partition` would serve, without advancing
    fn peek_partition(&self, queue: &GroupedQueue<T>) -> Option<Arc<TrackedQueue<T>>>;
}

/// Round-robin over non-empty groups
///
/// Keeps a cursor into the append-order group list. Each call scans forward
/// from the cursor (wrapping) for the first non-empty group, which gives
/// strict alternation between groups that all have pending work.
#[derive(Debug, Default)]
pub struct RoundRobinRouter {
    cursor: Mutex<usize>,
}

impl RoundRobinRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the first non-empty partition at or after `start` (wrapping)
    fn scan<T: Groupable>(partitions: &[Partition<T>], start: usize) -> Option<usize> {
        let len = partitions.len();
        (0..len)
            .map(|offset| (start + offset) % len)
            .find(|&idx| !partitions[idx].queue.is_empty())
    }
}

impl<T: Groupable + Send> GroupRouter<T> for RoundRobinRouter {
    fn next_partition(&self, queue: &GroupedQueue<T>) -> Option<Arc<TrackedQueue<T>>> {
        queue.with_partitions(|partitions| {
            if partitions.is_empty() {
                return None;
            }
            let mut cursor = self.cursor.lock();
            let idx = Self::scan(partitions, *cursor % partitions.len())?;
            *cursor = idx + 1;
            Some(Arc::clone(&partitions[idx].queue))
        })
    }

    fn peek_partition(&self, queue: &GroupedQueue<T>) -> Option<Arc<TrackedQueue<T>>> {
        queue.with_partitions(|partitions| {
            if partitions.is_empty() {
                return None;
            }
            let cursor = *self.cursor.lock();
            let idx = Self::scan(partitions, cursor % partitions.len())?;
            Some(Arc::clone(&partitions[idx].queue))
        })
    }
}
