//! Single ingestion path into the grouped queue

use std::sync::Arc;

use tracing::trace;

use crate::metrics::DispatchMetrics;
use crate::persistence::{StoreError, WorkStore};
use crate::queue::GroupedQueue;
use crate::work::WorkItem;

/// Writes an item through to the store, then queues it
///
/// Local producers, remote submissions and recovery all go through here, so
/// an item is never queued without being stored first.
#[derive(Clone)]
pub struct WorkIngress {
    queue: Arc<GroupedQueue<WorkItem>>,
    store: Arc<dyn WorkStore>,
    metrics: Arc<DispatchMetrics>,
}

impl WorkIngress {
    pub fn new(
        queue: Arc<GroupedQueue<WorkItem>>,
        store: Arc<dyn WorkStore>,
        metrics: Arc<DispatchMetrics>,
    ) -> Self {
        Self {
            queue,
            store,
            metrics,
        }
    }

    /// Persist and enqueue; a store failure leaves the queue untouched
    pub async fn offer(&self, mut item: WorkItem) -> Result<bool, StoreError> {
        item.record_submission();
        self.store.persist(&item).await?;
        self.metrics.submitted.increment();
        trace!(id = %item.id, group = %item.group, recovered = item.recovered, "Work item ingested");
        Ok(self.queue.offer(item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryWorkStore;
    use serde_json::json;

    fn ingress() -> (WorkIngress, Arc<GroupedQueue<WorkItem>>, Arc<InMemoryWorkStore>) {
        let queue = Arc::new(GroupedQueue::new());
        let store = Arc::new(InMemoryWorkStore::new());
        let metrics = Arc::new(DispatchMetrics::new());
        let ingress = WorkIngress::new(queue.clone(), store.clone(), metrics);
        (ingress, queue, store)
    }

    #[tokio::test]
    async fn test_offer_stores_then_queues() {
        let (ingress, queue, store) = ingress();
        let item = WorkItem::new("g", json!(1));
        let id = item.id;

        assert!(ingress.offer(item).await.unwrap());
        assert_eq!(queue.size(), 1);
        assert_eq!(store.get(id).await.unwrap().submissions, 1);
        assert_eq!(ingress.metrics.submitted.get(), 1);
    }

    #[tokio::test]
    async fn test_store_failure_does_not_queue() {
        let (ingress, queue, store) = ingress();
        store.set_unavailable(true);

        assert!(ingress.offer(WorkItem::new("g", json!(1))).await.is_err());
        assert!(queue.is_empty());
        assert_eq!(ingress.metrics.submitted.get(), 0);
    }
}
