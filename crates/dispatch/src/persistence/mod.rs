//! Storage of pending work
//!
//! This module provides:
//! - [`WorkStore`] - Trait for the store that keeps every accepted, unfinished item
//! - [`InMemoryWorkStore`] - In-memory implementation for tests and single-node use
//!
//! Items are written through on ingestion and removed once their handler
//! succeeds, so anything still in the store is either queued, running, or
//! abandoned. Stale work recovery relies on that to find abandoned work.

mod memory;
mod store;

pub use memory::InMemoryWorkStore;
pub use store::{StoreError, WorkStore};
