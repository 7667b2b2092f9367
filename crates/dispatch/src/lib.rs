//! # Grouped Work Dispatch
//!
//! Per-node dispatch core for a cluster that shares work across members.
//!
//! ## Features
//!
//! - **Grouped queue**: One FIFO per group key, groups discovered on first use,
//!   served round-robin so a busy group cannot starve the others
//! - **Bounded worker pool**: Fixed intake buffer, dynamic worker count and an
//!   explicit saturation policy (reject or run on the caller)
//! - **Queue sync loop**: Single consumer moving work from the queue into the
//!   pool, backing off exponentially while idle
//! - **Backoff timer**: Periodic maintenance tasks whose interval grows while
//!   they find nothing to do
//! - **Stale work recovery**: Work abandoned by a dead member is found in the
//!   work store and resubmitted
//! - **Work futures**: Locally submitted items hand back a future that
//!   resolves with the handler's result
//!
//! ## Architecture
//!
//! ```text
//!   producers / SubmitWork / recovery
//!                  │
//!                  ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkIngress                            │
//! │  (write-through to the WorkStore, then enqueue)              │
//! └─────────────────────────────────────────────────────────────┘
//!                  │
//!                  ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      GroupedQueue                            │
//! │  (TrackedQueue per group, GroupRouter picks the next one)    │
//! └─────────────────────────────────────────────────────────────┘
//!                  │  QueueSyncLoop
//!                  ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   BoundedWorkerPool                          │
//! │  (runs the handler, removes finished items from the store)   │
//! └─────────────────────────────────────────────────────────────┘
//!
//!   BackoffTimer ──▶ RecoveryTask ──▶ ClusterCoordinator + WorkStore
//! ```
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use taskmesh_dispatch::prelude::*;
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cluster = Arc::new(InMemoryCluster::new());
//! let service = Arc::new(DispatchService::new(
//!     DispatchConfig::default(),
//!     handler_fn(|item| async move {
//!         println!("processing {} for {}", item.id, item.group);
//!         Ok(json!({"done": true}))
//!     }),
//!     cluster.clone(),
//!     Arc::new(InMemoryWorkStore::new()),
//! )?);
//! cluster.join(service.member().clone(), &service);
//! service.start()?;
//!
//! service.offer(WorkItem::new("tenant-a", json!({"n": 1}))).await?;
//! service.offer(WorkItem::new("tenant-b", json!({"n": 2}))).await?;
//!
//! let undelivered = service.shutdown_now().await;
//! println!("{} items never started", undelivered.len());
//! # Ok(())
//! # }
//! ```

pub mod cluster;
pub mod config;
pub mod executor;
pub mod metrics;
pub mod persistence;
pub mod queue;
pub mod recovery;
pub mod reliability;
pub mod service;
pub mod timer;
pub mod work;

/// Prelude for common imports
pub mod prelude {
    pub use crate::cluster::{
        ClusterCoordinator, ClusterOp, ClusterOpHandler, ClusterReply, InMemoryCluster, MemberRef,
    };
    pub use crate::config::{ConfigError, DispatchConfig};
    pub use crate::executor::{BoundedWorkerPool, SaturationPolicy, SubmitError, WorkerPoolConfig};
    pub use crate::metrics::{DispatchMetrics, MetricsSnapshot};
    pub use crate::persistence::{InMemoryWorkStore, StoreError, WorkStore};
    pub use crate::queue::{GroupRouter, GroupedQueue, RoundRobinRouter, TrackedQueue};
    pub use crate::recovery::RecoveryConfig;
    pub use crate::reliability::BackoffConfig;
    pub use crate::service::{DispatchError, DispatchService, WorkFuture, WorkFutureError};
    pub use crate::timer::{BackoffTask, BackoffTimer, TaskError, TaskOutcome};
    pub use crate::work::{handler_fn, Groupable, WorkHandler, WorkItem, WorkResult};
}

// Re-export key types at crate root
pub use cluster::{ClusterCoordinator, ClusterError, InMemoryCluster, MemberRef};
pub use config::{ConfigError, DispatchConfig};
pub use executor::{
    BoundedWorkerPool, PoolError, QueueSyncLoop, SaturationPolicy, Submission, SubmitError,
    WorkerPoolConfig,
};
pub use metrics::{DispatchMetrics, MetricsSnapshot};
pub use persistence::{InMemoryWorkStore, StoreError, WorkStore};
pub use queue::{GroupRouter, GroupedQueue, RoundRobinRouter, TrackedQueue};
pub use recovery::{RecoveryConfig, RecoveryTask};
pub use reliability::{Backoff, BackoffConfig};
pub use service::{
    DispatchError, DispatchService, FutureTracker, WorkFuture, WorkFutureError, WorkIngress,
};
pub use timer::{BackoffTask, BackoffTimer, TaskOutcome};
pub use work::{handler_fn, Groupable, WorkItem};
