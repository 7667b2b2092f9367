//! WorkStore trait definition

use async_trait::async_trait;
use uuid::Uuid;

use crate::work::WorkItem;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Item not found
    #[error("work item not found: {0}")]
    NotFound(Uuid),

    /// Backend failure (connection, timeout, ...)
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Store of accepted, unfinished work items owned by this node
#[async_trait]
pub trait WorkStore: Send + Sync {
    /// Insert or replace an item
    async fn persist(&self, item: &WorkItem) -> Result<(), StoreError>;

    /// Remove an item; returns whether it was present
    async fn remove(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Fetch an item by id
    async fn get(&self, id: Uuid) -> Result<WorkItem, StoreError>;

    /// Local items created strictly before `created_before` (epoch millis),
    /// oldest first
    async fn query_local_pending(&self, created_before: i64) -> Result<Vec<WorkItem>, StoreError>;

    /// Number of stored items
    async fn pending_count(&self) -> Result<usize, StoreError>;
}
