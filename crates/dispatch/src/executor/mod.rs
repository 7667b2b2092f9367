//! Local execution of work items
//!
//! This module provides:
//! - [`BoundedWorkerPool`] - Capacity-bounded pool of tokio workers
//! - [`WorkerPoolConfig`] - Pool sizing, buffering and saturation policy
//! - [`QueueSyncLoop`] - Control loop moving work from the queue into the pool

mod pool;
mod sync_loop;

pub use pool::{
    BoundedWorkerPool, PoolError, SaturationPolicy, Submission, SubmitError, WorkerPoolConfig,
    WorkerPoolStatus,
};
pub use sync_loop::{QueueSyncLoop, SyncLoopHandle};
