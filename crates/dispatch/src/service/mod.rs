//! Per-node dispatch service
//!
//! [`DispatchService`] owns one node's grouped queue, worker pool, queue sync
//! loop and backoff timer, and answers the [`ClusterOp`]s other members send.
//!
//! Lifecycle:
//! 1. `new()` validates configuration and builds the components
//! 2. `start()` spawns the sync loop and schedules stale work recovery
//! 3. `offer()` persists work and queues it under its group; `submit()` does
//!    the same and hands back a [`WorkFuture`] for the item's result
//! 4. `shutdown()` / `shutdown_now()` stop intake; the latter also returns
//!    every locally accepted item that never started

mod completion;
mod ingress;

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::cluster::{
    ClusterCoordinator, ClusterError, ClusterOp, ClusterOpHandler, ClusterReply, MemberRef,
};
use crate::config::{ConfigError, DispatchConfig};
use crate::executor::{BoundedWorkerPool, PoolError, QueueSyncLoop, SyncLoopHandle};
use crate::metrics::{DispatchMetrics, Gauges, MetricsSnapshot};
use crate::persistence::{StoreError, WorkStore};
use crate::queue::GroupedQueue;
use crate::recovery::RecoveryTask;
use crate::timer::BackoffTimer;
use crate::work::{panic_message, WorkHandler, WorkItem};

pub use completion::{FutureTracker, WorkFuture, WorkFutureError};
pub use ingress::WorkIngress;

/// Dispatch service errors
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// The service is shut down; the item is handed back
    #[error("service is shut down, work item not accepted")]
    NotAccepting(Box<WorkItem>),

    #[error("service was shut down and cannot be started again")]
    AlreadyShutDown,
}

/// One node of the dispatch cluster
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use taskmesh_dispatch::cluster::InMemoryCluster;
/// use taskmesh_dispatch::work::handler_fn;
/// use taskmesh_dispatch::{DispatchConfig, DispatchService, InMemoryWorkStore, WorkItem};
/// use serde_json::json;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let cluster = Arc::new(InMemoryCluster::new());
/// let service = Arc::new(DispatchService::new(
///     DispatchConfig::default().with_node_id("node-1"),
///     handler_fn(|item| async move { Ok(item.payload) }),
///     cluster.clone(),
///     Arc::new(InMemoryWorkStore::new()),
/// )?);
/// cluster.join(service.member().clone(), &service);
///
/// service.start()?;
/// service.offer(WorkItem::new("tenant-a", json!({"n": 1}))).await?;
/// service.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct DispatchService {
    config: DispatchConfig,
    member: MemberRef,
    queue: Arc<GroupedQueue<WorkItem>>,
    pool: BoundedWorkerPool,
    ingress: WorkIngress,
    coordinator: Arc<dyn ClusterCoordinator>,
    store: Arc<dyn WorkStore>,
    metrics: Arc<DispatchMetrics>,
    futures: Arc<FutureTracker>,
    timer: BackoffTimer,
    started: AtomicBool,
    shutdown: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    sync_loop: Mutex<Option<SyncLoopHandle>>,
}

impl DispatchService {
    /// Build a service; nothing runs until [`start`](Self::start)
    ///
    /// Items whose handler returns `Ok` are removed from `store`. Failed or
    /// panicked items stay there and are picked up again by recovery. Either
    /// way a pending [`WorkFuture`] for the item is resolved.
    pub fn new(
        config: DispatchConfig,
        handler: WorkHandler,
        coordinator: Arc<dyn ClusterCoordinator>,
        store: Arc<dyn WorkStore>,
    ) -> Result<Self, DispatchError> {
        config.validate()?;

        let member = MemberRef::new(config.node_id.clone(), config.address.clone());
        let metrics = Arc::new(DispatchMetrics::new());
        let queue = Arc::new(GroupedQueue::new());
        let futures = Arc::new(FutureTracker::new());
        let pool = BoundedWorkerPool::new(
            config.pool.clone(),
            complete_work(handler, Arc::clone(&store), Arc::clone(&futures)),
            Arc::clone(&metrics),
        )?;
        let ingress = WorkIngress::new(
            Arc::clone(&queue),
            Arc::clone(&store),
            Arc::clone(&metrics),
        );
        let (shutdown_tx, _) = watch::channel(false);

        info!(node = %member, "Created dispatch service");

        Ok(Self {
            config,
            member,
            queue,
            pool,
            ingress,
            coordinator,
            store,
            metrics,
            futures,
            timer: BackoffTimer::new(),
            started: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            shutdown_tx,
            sync_loop: Mutex::new(None),
        })
    }

    /// Spawn the sync loop and schedule recovery; calling it again is a no-op
    #[instrument(skip(self), fields(node = %self.member))]
    pub fn start(&self) -> Result<(), DispatchError> {
        if self.is_shutdown() {
            return Err(DispatchError::AlreadyShutDown);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("Dispatch service already started");
            return Ok(());
        }

        let sync_loop = QueueSyncLoop::new(
            Arc::clone(&self.queue),
            self.pool.clone(),
            self.config.sync_backoff.clone(),
            self.shutdown_tx.subscribe(),
        );
        *self.sync_loop.lock() = Some(sync_loop.spawn());

        if self.config.recovery.enabled {
            let recovery = RecoveryTask::new(
                Arc::clone(&self.coordinator),
                Arc::clone(&self.store),
                self.ingress.clone(),
                Arc::clone(&self.metrics),
                self.config.recovery.clone(),
            );
            self.timer
                .schedule(Arc::new(recovery), self.config.recovery.backoff.clone());
        } else {
            info!("Stale work recovery disabled");
        }
        self.timer.start();

        info!(
            max_workers = self.config.pool.max_workers,
            queue_capacity = self.config.pool.queue_capacity,
            recovery = self.config.recovery.enabled,
            "Dispatch service started"
        );
        Ok(())
    }

    /// Persist `item` and queue it under its group
    pub async fn offer(&self, item: WorkItem) -> Result<bool, DispatchError> {
        if self.is_shutdown() {
            return Err(DispatchError::NotAccepting(Box::new(item)));
        }
        Ok(self.ingress.offer(item).await?)
    }

    /// Persist and queue `item`, returning a handle to its result
    ///
    /// The handle resolves when the item runs on this node. It resolves as
    /// cancelled if the item is drained or returned by `shutdown_now`, or if
    /// the node terminates without running it.
    pub async fn submit(&self, item: WorkItem) -> Result<WorkFuture, DispatchError> {
        if self.is_shutdown() {
            return Err(DispatchError::NotAccepting(Box::new(item)));
        }

        let id = item.id;
        let future = self.futures.register(id);
        match self.ingress.offer(item).await {
            Ok(accepted) => {
                if !accepted {
                    self.futures.cancel(id);
                }
                Ok(future)
            }
            Err(e) => {
                self.futures.cancel(id);
                Err(e.into())
            }
        }
    }

    /// Offer `item` to another member's queue
    pub async fn offer_remote(
        &self,
        member: &MemberRef,
        item: WorkItem,
    ) -> Result<bool, DispatchError> {
        let op = ClusterOp::SubmitWork(item);
        let op_name = op.name();
        match self.coordinator.invoke(member, op).await? {
            ClusterReply::Submitted(accepted) => Ok(accepted),
            reply => Err(ClusterError::UnexpectedReply {
                member: member.clone(),
                op: op_name,
                reply,
            }
            .into()),
        }
    }

    /// Items queued locally, not counting the pool buffer
    pub fn size(&self) -> usize {
        self.queue.size()
    }

    /// Creation time of the oldest queued item
    pub fn oldest_queue_time(&self) -> Option<i64> {
        self.queue.oldest_queue_time()
    }

    /// Age of the oldest queued item at `now_millis`
    pub fn oldest_item_age(&self, now_millis: i64) -> Option<i64> {
        self.oldest_queue_time()
            .map(|oldest| now_millis.saturating_sub(oldest).max(0))
    }

    /// Move up to `max` items of `group` into `sink`, oldest first
    ///
    /// Drained items leave this node's custody and are removed from the store.
    pub async fn drain_to<E>(&self, group: &str, sink: &mut E, max: usize) -> usize
    where
        E: Extend<WorkItem> + Send,
    {
        let mut drained = Vec::new();
        let count = self.queue.drain_to(group, &mut drained, max);
        for item in &drained {
            self.futures.cancel(item.id);
            if let Err(e) = self.store.remove(item.id).await {
                warn!(id = %item.id, group, error = %e, "Failed to remove drained item from store");
            }
        }
        sink.extend(drained);
        count
    }

    /// Stop intake and recovery; buffered and in-flight items still run
    ///
    /// Items left in the queue stay in the store for recovery to find.
    #[instrument(skip(self), fields(node = %self.member))]
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_tx.send_replace(true);
        self.pool.shutdown();
        self.timer.shutdown().await;
        info!(queued = self.size(), "Dispatch service shut down");
    }

    /// Stop everything and return every accepted item that never started
    ///
    /// Items come back in the order they would have run: pool buffer, the
    /// item the sync loop was holding, then each group's queue. They remain
    /// in the store.
    #[instrument(skip(self), fields(node = %self.member))]
    pub async fn shutdown_now(&self) -> Vec<WorkItem> {
        self.shutdown.store(true, Ordering::SeqCst);
        self.shutdown_tx.send_replace(true);

        let mut pending = self.pool.shutdown_now();
        let sync_loop = self.sync_loop.lock().take();
        if let Some(handle) = sync_loop {
            pending.extend(handle.join().await);
        }
        self.timer.shutdown().await;

        for group in self.queue.groups() {
            self.queue.drain_to(&group, &mut pending, usize::MAX);
        }
        for item in &pending {
            self.futures.cancel(item.id);
        }

        info!(returned = pending.len(), "Dispatch service shut down immediately");
        pending
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Shut down with no worker alive and the sync loop exited
    pub fn is_terminated(&self) -> bool {
        let sync_loop_done = self
            .sync_loop
            .lock()
            .as_ref()
            .map_or(true, |handle| handle.is_finished());
        self.is_shutdown() && self.pool.is_terminated() && sync_loop_done
    }

    /// Wait up to `timeout` for in-flight work to finish after shutdown
    ///
    /// Once the pool has terminated nothing else runs here, so futures for
    /// items still queued are cancelled.
    pub async fn await_termination(&self, timeout: Duration) -> Result<(), DispatchError> {
        self.pool.await_termination(timeout).await?;
        let cancelled = self.futures.cancel_all();
        if cancelled > 0 {
            debug!(cancelled, "Cancelled futures of work that never ran");
        }
        Ok(())
    }

    /// Started and not shut down
    pub fn is_ready(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.is_shutdown()
    }

    /// Counters, histograms and current gauges
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        let now = Utc::now().timestamp_millis();
        self.metrics.snapshot(Gauges {
            queue_size: self.size(),
            oldest_item_age_millis: self.oldest_item_age(now),
            active_workers: self.pool.active_workers(),
            busy_workers: self.pool.busy_workers(),
            buffered: self.pool.buffered(),
            futures_waiting: self.futures.len(),
        })
    }

    pub fn member(&self) -> &MemberRef {
        &self.member
    }

    pub fn metrics(&self) -> &Arc<DispatchMetrics> {
        &self.metrics
    }

    /// Callers still waiting on a [`WorkFuture`]
    pub fn futures_waiting(&self) -> usize {
        self.futures.len()
    }

    pub fn coordinator(&self) -> &Arc<dyn ClusterCoordinator> {
        &self.coordinator
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }
}

impl Drop for DispatchService {
    fn drop(&mut self) {
        if !self.is_shutdown() {
            self.shutdown_tx.send_replace(true);
            self.pool.shutdown();
        }
    }
}

#[async_trait]
impl ClusterOpHandler for DispatchService {
    async fn handle_cluster_op(&self, op: ClusterOp) -> ClusterReply {
        match op {
            ClusterOp::Ping => ClusterReply::Pong,
            ClusterOp::IsMemberReady => ClusterReply::Ready(self.is_ready()),
            ClusterOp::GetOldestTaskTimestamp => {
                ClusterReply::OldestTaskTimestamp(self.oldest_queue_time())
            }
            ClusterOp::GetLocalQueueSize => ClusterReply::LocalQueueSize(self.size()),
            ClusterOp::SubmitWork(item) => {
                let id = item.id;
                match self.offer(item).await {
                    Ok(accepted) => ClusterReply::Submitted(accepted),
                    Err(e) => {
                        warn!(id = %id, error = %e, "Refused remote submission");
                        ClusterReply::Submitted(false)
                    }
                }
            }
        }
    }
}

/// Wrap `handler` so successful items are removed from `store` and every
/// finished item resolves its future
fn complete_work(
    handler: WorkHandler,
    store: Arc<dyn WorkStore>,
    futures: Arc<FutureTracker>,
) -> WorkHandler {
    let wrapped: WorkHandler = Arc::new(move |item: WorkItem| {
        let handler = Arc::clone(&handler);
        let store = Arc::clone(&store);
        let futures = Arc::clone(&futures);
        Box::pin(async move {
            let id = item.id;
            let result = match AssertUnwindSafe(handler(item)).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => {
                    let message = format!("handler panicked: {}", panic_message(panic.as_ref()));
                    futures.complete(id, Err(message));
                    // The pool records and logs the panic
                    std::panic::resume_unwind(panic);
                }
            };
            if result.is_ok() {
                if let Err(e) = store.remove(id).await {
                    warn!(id = %id, error = %e, "Failed to remove completed item from store");
                }
            }
            futures.complete(id, result.clone());
            result
        })
    });
    wrapped
}
