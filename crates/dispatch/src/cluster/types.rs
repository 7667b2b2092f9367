//! Cluster member and operation types

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::work::WorkItem;

/// Identity of a cluster member
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberRef {
    pub id: String,
    pub address: String,
}

impl MemberRef {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
        }
    }
}

impl fmt::Display for MemberRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.address)
    }
}

/// A value returned by one member during a fan-out call
#[derive(Debug, Clone, PartialEq)]
pub struct MemberResponse<T> {
    pub member: MemberRef,
    pub value: T,
}

impl<T> MemberResponse<T> {
    pub fn new(member: MemberRef, value: T) -> Self {
        Self { member, value }
    }
}

/// Operation invoked on a member
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterOp {
    /// No-op used to measure liveness and latency
    Ping,
    /// Whether the member's dispatch service is started
    IsMemberReady,
    /// Creation time of the oldest item queued on the member
    GetOldestTaskTimestamp,
    /// Number of items queued on the member
    GetLocalQueueSize,
    /// Offer an item into the member's queue
    SubmitWork(WorkItem),
}

impl ClusterOp {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::IsMemberReady => "is_member_ready",
            Self::GetOldestTaskTimestamp => "get_oldest_task_timestamp",
            Self::GetLocalQueueSize => "get_local_queue_size",
            Self::SubmitWork(_) => "submit_work",
        }
    }
}

/// Reply to a [`ClusterOp`]
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterReply {
    Pong,
    Ready(bool),
    OldestTaskTimestamp(Option<i64>),
    LocalQueueSize(usize),
    Submitted(bool),
}

/// Cluster invocation errors
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// Member is not reachable (left, partitioned, or shut down)
    #[error("member {0} is unreachable")]
    Unreachable(MemberRef),

    /// The member did not answer in time
    #[error("member {member} did not answer {op} in time")]
    Timeout { member: MemberRef, op: &'static str },

    /// The member answered with a reply that does not match the operation
    #[error("unexpected reply to {op} from {member}: {reply:?}")]
    UnexpectedReply {
        member: MemberRef,
        op: &'static str,
        reply: ClusterReply,
    },

    /// Transport or remote failure
    #[error("invocation of {op} on {member} failed: {message}")]
    Invocation {
        member: MemberRef,
        op: &'static str,
        message: String,
    },
}
