//! Cluster coordination seam
//!
//! This module provides:
//! - [`ClusterCoordinator`] - Trait for membership and per-member invocation,
//!   with provided fan-out helpers (ready members, oldest timestamps, queue sizes)
//! - [`ClusterOp`] / [`ClusterReply`] - The remote operations a node answers
//! - [`ClusterOpHandler`] - Implemented by a node to answer those operations
//! - [`InMemoryCluster`] - In-process coordinator routing ops to local nodes
//!
//! Membership, failure detection and the wire protocol belong to whatever
//! implements [`ClusterCoordinator`]; the dispatch engine only consumes it.

mod coordinator;
mod memory;
mod types;

pub use coordinator::{ClusterCoordinator, ClusterOpHandler};
pub use memory::InMemoryCluster;
pub use types::{ClusterError, ClusterOp, ClusterReply, MemberRef, MemberResponse};
