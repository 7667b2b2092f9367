//! Bounded worker pool
//!
//! Executes work items on a dynamically sized set of tokio tasks fed from a
//! fixed-capacity buffer, with an explicit policy for saturation.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::{duration_millis, ConfigError};
use crate::metrics::DispatchMetrics;
use crate::work::{panic_message, WorkHandler, WorkItem};

/// What to do with a submission when every worker is busy and the buffer is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaturationPolicy {
    /// Hand the item back to the submitter
    #[default]
    Reject,
    /// Execute the item inline on the submitting task
    CallerRuns,
}

impl FromStr for SaturationPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "caller_runs" | "caller-runs" | "callerruns" => Ok(Self::CallerRuns),
            other => Err(ConfigError::Invalid(format!(
                "unknown saturation policy '{other}' (expected 'reject' or 'caller_runs')"
            ))),
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Name used in logs
    pub name: String,

    /// Workers kept alive even when idle
    pub min_workers: usize,

    /// Upper bound on concurrently running workers
    pub max_workers: usize,

    /// Items that may wait for a free worker
    pub queue_capacity: usize,

    /// Idle time after which a worker above `min_workers` exits
    #[serde(with = "duration_millis")]
    pub keep_alive: Duration,

    /// Behavior when saturated
    #[serde(default)]
    pub saturation_policy: SaturationPolicy,

    /// How long graceful shutdown waits for workers
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self::sized(10)
    }
}

impl WorkerPoolConfig {
    /// Pool of up to `max_workers` with a buffer twice that size
    pub fn sized(max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            name: "dispatch".to_string(),
            min_workers: 0,
            max_workers,
            queue_capacity: max_workers * 2,
            keep_alive: Duration::from_secs(60),
            saturation_policy: SaturationPolicy::Reject,
            shutdown_timeout: Duration::from_secs(30),
        }
    }

    /// Set the pool name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the number of always-alive workers
    pub fn with_min_workers(mut self, min: usize) -> Self {
        self.min_workers = min;
        self
    }

    /// Set the maximum number of workers
    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers = max.max(1);
        self
    }

    /// Set the buffer capacity
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the idle keep-alive
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Set the saturation policy
    pub fn with_saturation_policy(mut self, policy: SaturationPolicy) -> Self {
        self.saturation_policy = policy;
        self
    }

    /// Set the graceful shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::Invalid("max_workers must be at least 1".into()));
        }
        if self.min_workers > self.max_workers {
            return Err(ConfigError::Invalid(format!(
                "min_workers ({}) exceeds max_workers ({})",
                self.min_workers, self.max_workers
            )));
        }
        if self.keep_alive.is_zero() {
            return Err(ConfigError::Invalid("keep_alive must be greater than zero".into()));
        }
        Ok(())
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPoolStatus {
    /// Accepting submissions
    Running,
    /// Shut down, buffered or in-flight items still running
    Draining,
    /// Shut down with no worker alive
    Stopped,
}

/// How an accepted submission was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// A new worker was started with the item
    Started,
    /// The item waits in the buffer for a free worker
    Buffered,
    /// The item already ran on the submitting task
    RanOnCaller,
}

/// A submission the pool did not accept; always carries the item back
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// Every worker is busy and the buffer is full
    #[error("worker pool saturated, rejected work item {}", .0.id)]
    Rejected(WorkItem),

    /// The pool no longer accepts work
    #[error("worker pool is shut down, refused work item {}", .0.id)]
    Shutdown(WorkItem),
}

impl SubmitError {
    /// Recover the refused item
    pub fn into_item(self) -> WorkItem {
        match self {
            Self::Rejected(item) | Self::Shutdown(item) => item,
        }
    }
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Invalid configuration
    #[error("invalid worker pool configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// Workers still alive when the wait expired
    #[error("worker pool did not terminate in time ({remaining} workers still alive)")]
    ShutdownTimeout { remaining: usize },
}

struct PoolState {
    buffer: VecDeque<WorkItem>,
    live_workers: usize,
    /// Live workers parked waiting for work; each is a direct handoff slot
    waiting: usize,
    shutdown: bool,
}

struct PoolInner {
    config: WorkerPoolConfig,
    handler: WorkHandler,
    state: Mutex<PoolState>,
    work_available: Notify,
    cancel: CancellationToken,
    tracker: TaskTracker,
    busy: AtomicUsize,
    metrics: Arc<DispatchMetrics>,
}

enum Placement {
    Spawn(WorkItem),
    BufferedSpawn,
    Buffered,
    Saturated(WorkItem),
}

enum NextStep {
    Run(WorkItem),
    Wait,
    Exit,
}

/// Bounded, dynamically sized pool of workers
///
/// Submissions follow thread-pool-executor rules: below `min_workers` a new
/// worker starts with the item; otherwise the item is buffered while the
/// buffer has room (an idle worker counts as room); otherwise a new worker
/// starts while below `max_workers`; otherwise the [`SaturationPolicy`]
/// applies.
///
/// Cloning is cheap and yields a handle to the same pool.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use taskmesh_dispatch::{BoundedWorkerPool, DispatchMetrics, WorkItem, WorkerPoolConfig};
/// use taskmesh_dispatch::work::handler_fn;
/// use serde_json::json;
///
/// # #[tokio::main]
/// # async fn main() {
/// let pool = BoundedWorkerPool::new(
///     WorkerPoolConfig::sized(4),
///     handler_fn(|item| async move { Ok(item.payload) }),
///     Arc::new(DispatchMetrics::new()),
/// )
/// .unwrap();
///
/// pool.submit(WorkItem::new("g", json!(1))).await.unwrap();
/// pool.shutdown();
/// pool.await_termination(std::time::Duration::from_secs(1)).await.unwrap();
/// # }
/// ```
#[derive(Clone)]
pub struct BoundedWorkerPool {
    inner: Arc<PoolInner>,
}

impl BoundedWorkerPool {
    /// Create a pool; no worker starts until the first submission
    pub fn new(
        config: WorkerPoolConfig,
        handler: WorkHandler,
        metrics: Arc<DispatchMetrics>,
    ) -> Result<Self, PoolError> {
        config.validate()?;

        info!(
            pool = %config.name,
            min_workers = config.min_workers,
            max_workers = config.max_workers,
            queue_capacity = config.queue_capacity,
            policy = ?config.saturation_policy,
            "Created worker pool"
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    buffer: VecDeque::with_capacity(config.queue_capacity),
                    live_workers: 0,
                    waiting: 0,
                    shutdown: false,
                }),
                config,
                handler,
                work_available: Notify::new(),
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
                busy: AtomicUsize::new(0),
                metrics,
            }),
        })
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.inner.config
    }

    /// Submit an item for execution
    ///
    /// Never blocks except under [`SaturationPolicy::CallerRuns`], where the
    /// item runs to completion before this returns.
    pub async fn submit(&self, item: WorkItem) -> Result<Submission, SubmitError> {
        let placement = {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                return Err(SubmitError::Shutdown(item));
            }

            let config = &self.inner.config;
            if state.live_workers < config.min_workers {
                state.live_workers += 1;
                Placement::Spawn(item)
            } else if state.buffer.len() < config.queue_capacity + state.waiting {
                state.buffer.push_back(item);
                if state.live_workers == 0 {
                    state.live_workers += 1;
                    Placement::BufferedSpawn
                } else {
                    Placement::Buffered
                }
            } else if state.live_workers < config.max_workers {
                state.live_workers += 1;
                Placement::Spawn(item)
            } else {
                Placement::Saturated(item)
            }
        };

        match placement {
            Placement::Spawn(item) => {
                self.spawn_worker(Some(item));
                Ok(Submission::Started)
            }
            Placement::BufferedSpawn => {
                self.spawn_worker(None);
                Ok(Submission::Buffered)
            }
            Placement::Buffered => {
                self.inner.work_available.notify_one();
                Ok(Submission::Buffered)
            }
            Placement::Saturated(item) => match self.inner.config.saturation_policy {
                SaturationPolicy::Reject => {
                    self.inner.metrics.rejected.increment();
                    warn!(
                        pool = %self.inner.config.name,
                        work_id = %item.id,
                        group = %item.group,
                        "Worker pool saturated, rejecting work item"
                    );
                    Err(SubmitError::Rejected(item))
                }
                SaturationPolicy::CallerRuns => {
                    debug!(work_id = %item.id, "Worker pool saturated, running on caller");
                    // Keeps the pool from terminating until the item returns
                    let _in_flight = self.inner.tracker.token();
                    self.inner.run_item(item).await;
                    Ok(Submission::RanOnCaller)
                }
            },
        }
    }

    /// Stop accepting work; buffered and in-flight items still run
    #[instrument(skip(self), fields(pool = %self.inner.config.name))]
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            info!(
                buffered = state.buffer.len(),
                live_workers = state.live_workers,
                "Shutting down worker pool"
            );
        }
        self.inner.tracker.close();
        self.inner.cancel.cancel();
    }

    /// Stop accepting work and return buffered items that never started
    #[instrument(skip(self), fields(pool = %self.inner.config.name))]
    pub fn shutdown_now(&self) -> Vec<WorkItem> {
        let pending: Vec<WorkItem> = {
            let mut state = self.inner.state.lock();
            state.shutdown = true;
            state.buffer.drain(..).collect()
        };
        info!(returned = pending.len(), "Shutting down worker pool immediately");
        self.inner.tracker.close();
        self.inner.cancel.cancel();
        pending
    }

    /// Shut down and wait up to the configured timeout for workers to finish
    pub async fn shutdown_gracefully(&self) -> Result<(), PoolError> {
        self.shutdown();
        self.await_termination(self.inner.config.shutdown_timeout).await
    }

    /// Wait until the pool is terminated or `timeout` elapses
    pub async fn await_termination(&self, timeout: Duration) -> Result<(), PoolError> {
        match tokio::time::timeout(timeout, self.inner.tracker.wait()).await {
            Ok(()) => {
                debug!(pool = %self.inner.config.name, "All workers finished");
                Ok(())
            }
            Err(_) => {
                let remaining = self.active_workers();
                warn!(pool = %self.inner.config.name, remaining, "Shutdown timeout reached");
                Err(PoolError::ShutdownTimeout { remaining })
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.state.lock().shutdown
    }

    /// Shut down, no worker alive and no caller-run item in flight
    pub fn is_terminated(&self) -> bool {
        self.status() == WorkerPoolStatus::Stopped
    }

    pub fn status(&self) -> WorkerPoolStatus {
        let state = self.inner.state.lock();
        match (state.shutdown, state.live_workers) {
            (false, _) => WorkerPoolStatus::Running,
            (true, 0) if self.inner.tracker.is_empty() => WorkerPoolStatus::Stopped,
            (true, _) => WorkerPoolStatus::Draining,
        }
    }

    /// Workers currently alive, busy or idle
    pub fn active_workers(&self) -> usize {
        self.inner.state.lock().live_workers
    }

    /// Items currently executing, including caller-run items
    pub fn busy_workers(&self) -> usize {
        self.inner.busy.load(Ordering::Relaxed)
    }

    /// Items waiting in the buffer
    pub fn buffered(&self) -> usize {
        self.inner.state.lock().buffer.len()
    }

    fn spawn_worker(&self, first: Option<WorkItem>) {
        let inner = Arc::clone(&self.inner);
        self.inner.tracker.spawn(async move {
            inner.worker_loop(first).await;
        });
    }
}

impl PoolInner {
    async fn worker_loop(self: Arc<Self>, first: Option<WorkItem>) {
        trace!(pool = %self.config.name, "Worker started");
        if let Some(item) = first {
            self.run_item(item).await;
        }

        loop {
            match self.next_step() {
                NextStep::Run(item) => self.run_item(item).await,
                NextStep::Exit => break,
                NextStep::Wait => {
                    let timed_out = tokio::select! {
                        _ = self.work_available.notified() => false,
                        _ = self.cancel.cancelled() => false,
                        _ = tokio::time::sleep(self.config.keep_alive) => true,
                    };
                    if self.finish_wait(timed_out) {
                        break;
                    }
                }
            }
        }

        trace!(pool = %self.config.name, "Worker exited");
    }

    fn next_step(&self) -> NextStep {
        let mut state = self.state.lock();
        if let Some(item) = state.buffer.pop_front() {
            return NextStep::Run(item);
        }
        if state.shutdown {
            state.live_workers -= 1;
            return NextStep::Exit;
        }
        state.waiting += 1;
        NextStep::Wait
    }

    /// Leave the waiting state; returns `true` if the worker should retire
    fn finish_wait(&self, timed_out: bool) -> bool {
        let mut state = self.state.lock();
        state.waiting -= 1;
        if timed_out && state.buffer.is_empty() && state.live_workers > self.config.min_workers {
            state.live_workers -= 1;
            debug!(
                pool = %self.config.name,
                live_workers = state.live_workers,
                "Idle worker retired"
            );
            return true;
        }
        false
    }

    async fn run_item(&self, item: WorkItem) {
        let work_id = item.id;
        let group = item.group.clone();
        let handler = Arc::clone(&self.handler);

        self.busy.fetch_add(1, Ordering::Relaxed);
        let outcome = AssertUnwindSafe(async move { handler(item).await })
            .catch_unwind()
            .await;
        self.busy.fetch_sub(1, Ordering::Relaxed);

        match outcome {
            Ok(Ok(_)) => {
                self.metrics.completed.increment();
                debug!(work_id = %work_id, group = %group, "Work item completed");
            }
            Ok(Err(e)) => {
                self.metrics.failed.increment();
                warn!(work_id = %work_id, group = %group, error = %e, "Work item failed");
            }
            Err(panic) => {
                self.metrics.failed.increment();
                error!(
                    work_id = %work_id,
                    group = %group,
                    panic = %panic_message(panic.as_ref()),
                    "Work handler panicked"
                );
            }
        }
    }
}
