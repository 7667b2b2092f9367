//! Control loop feeding the worker pool from the grouped queue

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

use super::{BoundedWorkerPool, SubmitError};
use crate::queue::GroupedQueue;
use crate::reliability::{Backoff, BackoffConfig};
use crate::work::WorkItem;

/// Sole consumer of a [`GroupedQueue`]
///
/// Polls the queue and submits into the pool. An empty poll or a rejected
/// submission waits for the current backoff interval and grows it; only an
/// accepted submission resets it. An item the pool rejects is held and retried
/// before anything new is polled, so rejection neither drops nor reorders work.
pub struct QueueSyncLoop {
    queue: Arc<GroupedQueue<WorkItem>>,
    pool: BoundedWorkerPool,
    backoff: Backoff,
    shutdown_rx: watch::Receiver<bool>,
    held: Arc<Mutex<Option<WorkItem>>>,
}

/// Handle to a running [`QueueSyncLoop`]
pub struct SyncLoopHandle {
    task: JoinHandle<()>,
    held: Arc<Mutex<Option<WorkItem>>>,
}

impl SyncLoopHandle {
    /// Take the item the loop is holding after a refused submission
    pub fn take_held(&self) -> Option<WorkItem> {
        self.held.lock().take()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the loop to exit and return any item it was still holding
    pub async fn join(self) -> Option<WorkItem> {
        if let Err(e) = self.task.await {
            error!(error = %e, "Queue sync loop terminated abnormally");
        }
        self.held.lock().take()
    }
}

impl QueueSyncLoop {
    pub fn new(
        queue: Arc<GroupedQueue<WorkItem>>,
        pool: BoundedWorkerPool,
        backoff: BackoffConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            queue,
            pool,
            backoff: Backoff::new(backoff),
            shutdown_rx,
            held: Arc::new(Mutex::new(None)),
        }
    }

    /// Run the loop on its own task
    pub fn spawn(self) -> SyncLoopHandle {
        let held = Arc::clone(&self.held);
        let task = tokio::spawn(self.run());
        SyncLoopHandle { task, held }
    }

    /// Run until the pool shuts down or shutdown is signaled
    pub async fn run(mut self) {
        info!(pool = %self.pool.config().name, "Queue sync loop started");

        while !self.should_stop() {
            let next = self.held.lock().take().or_else(|| self.queue.poll());

            let Some(item) = next else {
                if self.wait(self.backoff.current()).await {
                    break;
                }
                let interval = self.backoff.increase();
                trace!(interval_ms = interval.as_millis() as u64, "Queue empty, backing off");
                continue;
            };

            match self.pool.submit(item).await {
                Ok(_) => self.backoff.reset(),
                Err(SubmitError::Rejected(item)) => {
                    debug!(
                        work_id = %item.id,
                        group = %item.group,
                        retry_in_ms = self.backoff.current().as_millis() as u64,
                        "Pool saturated, holding work item"
                    );
                    *self.held.lock() = Some(item);
                    if self.wait(self.backoff.current()).await {
                        break;
                    }
                    self.backoff.increase();
                }
                Err(SubmitError::Shutdown(item)) => {
                    debug!(work_id = %item.id, "Pool shut down, holding work item");
                    *self.held.lock() = Some(item);
                    break;
                }
            }
        }

        info!(
            holding = self.held.lock().is_some(),
            "Queue sync loop stopped"
        );
    }

    fn should_stop(&self) -> bool {
        *self.shutdown_rx.borrow() || self.pool.is_shutdown()
    }

    /// Sleep for `interval`; returns `true` if shutdown was signaled instead
    async fn wait(&mut self, interval: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(interval) => false,
            changed = self.shutdown_rx.changed() => {
                // A dropped sender also means nobody will ever resume us
                changed.is_err() || *self.shutdown_rx.borrow()
            }
        }
    }
}
