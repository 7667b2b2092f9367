//! Completion handles for locally submitted work

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::trace;
use uuid::Uuid;

use crate::work::WorkResult;

/// Why a [`WorkFuture`] resolved without a value
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WorkFutureError {
    /// The handler returned an error or panicked
    #[error("work item failed: {0}")]
    Failed(String),

    /// The item left this node before it ran (drained, returned by
    /// `shutdown_now`, or never accepted)
    #[error("work item {0} was cancelled before it ran")]
    Cancelled(Uuid),
}

/// Resolves with the handler's result once the item has run on this node
#[derive(Debug)]
pub struct WorkFuture {
    id: Uuid,
    rx: oneshot::Receiver<WorkResult>,
}

impl WorkFuture {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Future for WorkFuture {
    type Output = Result<serde_json::Value, WorkFutureError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let id = self.id;
        Pin::new(&mut self.rx).poll(cx).map(|received| match received {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(WorkFutureError::Failed(message)),
            Err(_) => Err(WorkFutureError::Cancelled(id)),
        })
    }
}

/// Pending [`WorkFuture`]s keyed by work item id
///
/// An entry lives from submission until the item finishes or is cancelled;
/// [`len`](Self::len) is the number of callers still waiting.
#[derive(Debug, Default)]
pub struct FutureTracker {
    pending: DashMap<Uuid, oneshot::Sender<WorkResult>>,
}

impl FutureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `id`; a second registration replaces the first
    pub fn register(&self, id: Uuid) -> WorkFuture {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        WorkFuture { id, rx }
    }

    /// Resolve the future for `id`; returns whether one was waiting
    pub fn complete(&self, id: Uuid, result: WorkResult) -> bool {
        match self.pending.remove(&id) {
            Some((_, tx)) => {
                // The caller may have dropped its handle already
                let delivered = tx.send(result).is_ok();
                trace!(id = %id, delivered, "Completed work future");
                true
            }
            None => false,
        }
    }

    /// Resolve the future for `id` as cancelled
    pub fn cancel(&self, id: Uuid) -> bool {
        self.pending.remove(&id).is_some()
    }

    /// Cancel every pending future; returns how many were waiting
    pub fn cancel_all(&self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_complete_resolves_future() {
        let tracker = FutureTracker::new();
        let id = Uuid::now_v7();
        let future = tracker.register(id);
        assert_eq!(tracker.len(), 1);

        assert!(tracker.complete(id, Ok(json!({"sum": 3}))));
        assert!(tracker.is_empty());
        assert_eq!(future.await, Ok(json!({"sum": 3})));
    }

    #[tokio::test]
    async fn test_failure_and_cancellation() {
        let tracker = FutureTracker::new();
        let failed = tracker.register(Uuid::now_v7());
        let cancelled = tracker.register(Uuid::now_v7());
        let cancelled_id = cancelled.id();

        tracker.complete(failed.id(), Err("bad payload".to_string()));
        assert!(tracker.cancel(cancelled_id));
        assert!(!tracker.cancel(cancelled_id));

        assert_eq!(
            failed.await,
            Err(WorkFutureError::Failed("bad payload".to_string()))
        );
        assert_eq!(cancelled.await, Err(WorkFutureError::Cancelled(cancelled_id)));
    }

    #[test]
    fn test_unknown_or_abandoned_ids() {
        let tracker = FutureTracker::new();
        assert!(!tracker.complete(Uuid::now_v7(), Ok(json!(null))));

        // A dropped handle still clears the entry
        let id = Uuid::now_v7();
        drop(tracker.register(id));
        assert!(tracker.complete(id, Ok(json!(null))));
        assert!(tracker.is_empty());

        tracker.register(Uuid::now_v7());
        tracker.register(Uuid::now_v7());
        assert_eq!(tracker.cancel_all(), 2);
    }
}
