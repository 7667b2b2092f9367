//! FIFO queue tracking the creation time of its head

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::work::Groupable;

/// Unbounded FIFO queue that knows how old its oldest element is
///
/// The head and its timestamp are always read under the same lock as the
/// mutation that changes the head, so `oldest_item_time` can never observe a
/// half-applied offer or poll.
pub struct TrackedQueue<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T: Groupable> TrackedQueue<T> {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
        }
    }

    /// Append an item; never blocks and always succeeds
    pub fn offer(&self, item: T) -> bool {
        self.items.lock().push_back(item);
        true
    }

    /// Remove and return the head
    pub fn poll(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Creation time of the current head, `None` when empty
    pub fn oldest_item_time(&self) -> Option<i64> {
        self.items.lock().front().map(Groupable::created_at_millis)
    }

    /// Move up to `max` items from the front into `sink`
    ///
    /// Returns the number of items moved.
    pub fn drain_to<E: Extend<T>>(&self, sink: &mut E, max: usize) -> usize {
        let mut items = self.items.lock();
        let count = max.min(items.len());
        sink.extend(items.drain(..count));
        count
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

impl<T: Groupable + Clone> TrackedQueue<T> {
    /// Return a copy of the head without removing it
    pub fn peek(&self) -> Option<T> {
        self.items.lock().front().cloned()
    }
}

impl<T: Groupable> Default for TrackedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
