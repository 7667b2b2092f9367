//! Grouped queueing with fair scheduling across groups
//!
//! This module provides:
//! - [`TrackedQueue`] - FIFO queue that reports its head's creation time in O(1)
//! - [`GroupedQueue`] - One tracked queue per group, served through a router
//! - [`GroupRouter`] - Strategy deciding which group is served next
//! - [`RoundRobinRouter`] - Default router visiting non-empty groups in turn
//!
//! # Architecture
//!
//! ```text
//!   offer(item) ──► group key ──► ┌──────────────────────────────┐
//!                                 │ DashMap<group, TrackedQueue> │
//!                                 └──────────────┬───────────────┘
//!                                                │ append-only
//!                                 ┌──────────────▼───────────────┐
//!                                 │ partitions: [g1, g2, g3, ..] │◄── cursor
//!                                 └──────────────┬───────────────┘
//!                                                │ next_partition()
//!   poll() ◄──────── head of chosen group ◄──────┘
//! ```
//!
//! Groups are discovered lazily on first offer and never removed; each group
//! keeps its own lock so producers of one group never contend with another.

mod grouped;
mod router;
mod tracked;

pub use grouped::{GroupedQueue, Partition};
pub use router::{GroupRouter, RoundRobinRouter};
pub use tracked::TrackedQueue;
