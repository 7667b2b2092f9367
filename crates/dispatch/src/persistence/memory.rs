//! In-memory implementation of WorkStore

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::{StoreError, WorkStore};
use crate::work::WorkItem;

/// In-memory implementation of [`WorkStore`]
///
/// Items are stored as they were last persisted. The store can be switched
/// to an unavailable state, in which every call fails with
/// [`StoreError::Backend`].
///
/// # Example
///
/// ```
/// use taskmesh_dispatch::InMemoryWorkStore;
///
/// let store = InMemoryWorkStore::new();
/// assert!(store.is_empty());
/// ```
#[derive(Default)]
pub struct InMemoryWorkStore {
    items: RwLock<HashMap<Uuid, WorkItem>>,
    unavailable: AtomicBool,
}

impl InMemoryWorkStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.items.read().contains_key(&id)
    }

    /// Remove every item
    pub fn clear(&self) {
        self.items.write().clear();
    }

    /// Make every subsequent call fail (or succeed again)
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("in-memory store marked unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl WorkStore for InMemoryWorkStore {
    async fn persist(&self, item: &WorkItem) -> Result<(), StoreError> {
        self.check_available()?;
        self.items.write().insert(item.id, item.clone());
        Ok(())
    }

    async fn remove(&self, id: Uuid) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self.items.write().remove(&id).is_some())
    }

    async fn get(&self, id: Uuid) -> Result<WorkItem, StoreError> {
        self.check_available()?;
        self.items
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn query_local_pending(&self, created_before: i64) -> Result<Vec<WorkItem>, StoreError> {
        self.check_available()?;
        let mut stale: Vec<WorkItem> = self
            .items
            .read()
            .values()
            .filter(|item| item.created_at_millis < created_before)
            .cloned()
            .collect();
        stale.sort_by_key(|item| (item.created_at_millis, item.id));
        Ok(stale)
    }

    async fn pending_count(&self) -> Result<usize, StoreError> {
        self.check_available()?;
        Ok(self.len())
    }
}
