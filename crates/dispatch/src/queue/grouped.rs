//! Router-driven aggregate of per-group queues

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;

use super::{GroupRouter, RoundRobinRouter, TrackedQueue};
use crate::work::Groupable;

/// A discovered group and its queue
pub struct Partition<T> {
    pub group: String,
    pub queue: Arc<TrackedQueue<T>>,
}

impl<T> Clone for Partition<T> {
    fn clone(&self) -> Self {
        Self {
            group: self.group.clone(),
            queue: Arc::clone(&self.queue),
        }
    }
}

/// Queue over the union of per-group FIFO queues
///
/// `offer` routes by [`Groupable::group`], creating the group's queue on first
/// use. `poll` and `peek` ask the [`GroupRouter`] which group to serve.
///
/// # Example
///
/// ```
/// use taskmesh_dispatch::{GroupedQueue, WorkItem};
/// use serde_json::json;
///
/// let queue = GroupedQueue::new();
/// queue.offer(WorkItem::new("a", json!(1)));
/// queue.offer(WorkItem::new("a", json!(2)));
/// queue.offer(WorkItem::new("b", json!(3)));
///
/// // Groups are served in turn
/// assert_eq!(queue.poll().unwrap().group, "a");
/// assert_eq!(queue.poll().unwrap().group, "b");
/// assert_eq!(queue.poll().unwrap().group, "a");
/// assert!(queue.poll().is_none());
/// ```
pub struct GroupedQueue<T> {
    queues: DashMap<String, Arc<TrackedQueue<T>>>,
    /// Append-only, in discovery order
    partitions: RwLock<Vec<Partition<T>>>,
    router: Box<dyn GroupRouter<T>>,
}

impl<T: Groupable + Send + 'static> GroupedQueue<T> {
    /// Create an empty queue served round-robin
    pub fn new() -> Self {
        Self::with_router(RoundRobinRouter::new())
    }
}

impl<T: Groupable + Send + 'static> Default for GroupedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Groupable> GroupedQueue<T> {
    /// Create an empty queue served by a custom router
    pub fn with_router(router: impl GroupRouter<T> + 'static) -> Self {
        Self {
            queues: DashMap::new(),
            partitions: RwLock::new(Vec::new()),
            router: Box::new(router),
        }
    }

    /// Enqueue an item at the back of its group
    pub fn offer(&self, item: T) -> bool {
        let queue = self.queue_or_create(item.group());
        queue.offer(item)
    }

    /// Dequeue the head of the group chosen by the router
    ///
    /// Returns `None` when every group is empty, or when the chosen group was
    /// emptied concurrently.
    pub fn poll(&self) -> Option<T> {
        self.router.next_partition(self)?.poll()
    }

    /// Total number of queued items across all groups
    pub fn size(&self) -> usize {
        self.with_partitions(|partitions| partitions.iter().map(|p| p.queue.len()).sum())
    }

    pub fn is_empty(&self) -> bool {
        self.with_partitions(|partitions| partitions.iter().all(|p| p.queue.is_empty()))
    }

    /// Minimum head creation time across groups, `None` when all are empty
    pub fn oldest_queue_time(&self) -> Option<i64> {
        self.with_partitions(|partitions| {
            partitions
                .iter()
                .filter_map(|p| p.queue.oldest_item_time())
                .min()
        })
    }

    /// Move up to `max` items of one group into `sink`
    ///
    /// Returns 0 for a group that was never offered to.
    pub fn drain_to<E: Extend<T>>(&self, group: &str, sink: &mut E, max: usize) -> usize {
        match self.queue_for(group) {
            Some(queue) => queue.drain_to(sink, max),
            None => 0,
        }
    }

    /// Discovered group keys in discovery order
    pub fn groups(&self) -> Vec<String> {
        self.with_partitions(|partitions| partitions.iter().map(|p| p.group.clone()).collect())
    }

    /// Number of queued items in one group
    pub fn group_len(&self, group: &str) -> usize {
        self.queue_for(group).map_or(0, |queue| queue.len())
    }

    /// Queue of an existing group
    pub fn queue_for(&self, group: &str) -> Option<Arc<TrackedQueue<T>>> {
        self.queues.get(group).map(|entry| Arc::clone(entry.value()))
    }

    /// Run `f` against the current partition list
    ///
    /// Routers use this to scan groups. The list is read-locked for the
    /// duration of `f`, so `f` must not offer into this queue.
    pub fn with_partitions<R>(&self, f: impl FnOnce(&[Partition<T>]) -> R) -> R {
        f(&self.partitions.read())
    }

    fn queue_or_create(&self, group: &str) -> Arc<TrackedQueue<T>> {
        if let Some(existing) = self.queues.get(group) {
            return Arc::clone(existing.value());
        }

        // The vacant entry holds the shard lock, so only one creator per key
        // gets here and the partition list sees the key exactly once.
        match self.queues.entry(group.to_string()) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let queue = Arc::new(TrackedQueue::new());
                self.partitions.write().push(Partition {
                    group: group.to_string(),
                    queue: Arc::clone(&queue),
                });
                entry.insert(Arc::clone(&queue));
                tracing::debug!(group = %group, "discovered new group");
                queue
            }
        }
    }
}

impl<T: Groupable + Clone> GroupedQueue<T> {
    /// Copy of the head that the next `poll` would most likely return
    pub fn peek(&self) -> Option<T> {
        self.router.peek_partition(self)?.peek()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::WorkItem;
    use serde_json::json;
    use std::collections::HashMap;

    fn item(group: &str, created_at: i64) -> WorkItem {
        WorkItem::new(group, json!(created_at)).with_created_at(created_at)
    }

    #[test]
    fn test_empty_queue() {
        let queue: GroupedQueue<WorkItem> = GroupedQueue::new();
        assert!(queue.poll().is_none());
        assert!(queue.peek().is_none());
        assert_eq!(queue.size(), 0);
        assert!(queue.is_empty());
        assert!(queue.oldest_queue_time().is_none());
    }

    #[test]
    fn test_every_item_polled_once_fifo_per_group() {
        let queue = GroupedQueue::new();
        let mut expected: HashMap<String, Vec<i64>> = HashMap::new();
        for t in 0..30 {
            let group = format!("g{}", t % 4);
            expected.entry(group.clone()).or_default().push(t);
            queue.offer(item(&group, t));
        }

        let mut seen: HashMap<String, Vec<i64>> = HashMap::new();
        while let Some(polled) = queue.poll() {
            seen.entry(polled.group.clone())
                .or_default()
                .push(polled.created_at_millis);
        }

        assert_eq!(seen, expected);
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn test_two_groups_strictly_alternate() {
        let queue = GroupedQueue::new();
        for t in 0..5 {
            queue.offer(item("g1", t));
        }
        for t in 0..5 {
            queue.offer(item("g2", t));
        }

        let groups: Vec<String> = (0..10).filter_map(|_| queue.poll()).map(|i| i.group).collect();
        for pair in groups.windows(2) {
            assert_ne!(pair[0], pair[1]);
        }
        assert_eq!(groups.len(), 10);
    }

    #[test]
    fn test_oldest_is_minimum_over_heads() {
        let queue = GroupedQueue::new();
        queue.offer(item("a", 300));
        queue.offer(item("b", 100));
        queue.offer(item("c", 200));

        assert_eq!(queue.oldest_queue_time(), Some(100));
        queue.drain_to("b", &mut Vec::new(), 1);
        assert_eq!(queue.oldest_queue_time(), Some(200));
    }

    #[test]
    fn test_single_group_scenario() {
        let queue = GroupedQueue::new();
        queue.offer(item("A", 1));
        queue.offer(item("A", 2));
        queue.offer(item("A", 3));

        assert_eq!(queue.poll().map(|i| i.created_at_millis), Some(1));
        assert_eq!(queue.oldest_queue_time(), Some(2));

        let mut rest = Vec::new();
        assert_eq!(queue.drain_to("A", &mut rest, usize::MAX), 2);
        assert_eq!(queue.size(), 0);
        assert!(queue.oldest_queue_time().is_none());
    }

    #[test]
    fn test_drain_unknown_group() {
        let queue: GroupedQueue<WorkItem> = GroupedQueue::new();
        let mut sink = Vec::new();
        assert_eq!(queue.drain_to("missing", &mut sink, 10), 0);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_groups_persist_when_empty() {
        let queue = GroupedQueue::new();
        queue.offer(item("a", 1));
        queue.offer(item("b", 2));
        while queue.poll().is_some() {}

        assert_eq!(queue.groups(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(queue.group_len("a"), 0);
        assert!(queue.queue_for("b").is_some());
    }

    #[test]
    fn test_concurrent_first_offers_create_group_once() {
        let queue: GroupedQueue<WorkItem> = GroupedQueue::new();

        std::thread::scope(|scope| {
            for worker in 0..8 {
                let queue = &queue;
                scope.spawn(move || {
                    for n in 0..50 {
                        queue.offer(item("shared", worker * 100 + n));
                    }
                });
            }
        });

        assert_eq!(queue.groups(), vec!["shared".to_string()]);
        assert_eq!(queue.size(), 400);
        assert_eq!(queue.group_len("shared"), 400);
    }

    struct LastGroupRouter;

    impl GroupRouter<WorkItem> for LastGroupRouter {
        fn next_partition(
            &self,
            queue: &GroupedQueue<WorkItem>,
        ) -> Option<Arc<TrackedQueue<WorkItem>>> {
            queue.with_partitions(|parts| parts.last().map(|p| Arc::clone(&p.queue)))
        }

        fn peek_partition(
            &self,
            queue: &GroupedQueue<WorkItem>,
        ) -> Option<Arc<TrackedQueue<WorkItem>>> {
            self.next_partition(queue)
        }
    }

    #[test]
    fn test_custom_router_and_emptied_group() {
        let queue = GroupedQueue::with_router(LastGroupRouter);
        queue.offer(item("a", 1));
        queue.offer(item("b", 2));

        assert_eq!(queue.poll().map(|i| i.group), Some("b".to_string()));
        // Router keeps picking the now-empty group; poll reports nothing
        assert!(queue.poll().is_none());
        assert_eq!(queue.size(), 1);
    }
}
