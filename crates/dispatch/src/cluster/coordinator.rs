//! ClusterCoordinator trait definition

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, warn};

use super::types::{ClusterError, ClusterOp, ClusterReply, MemberRef, MemberResponse};

/// Answers [`ClusterOp`]s addressed to this node
#[async_trait]
pub trait ClusterOpHandler: Send + Sync {
    async fn handle_cluster_op(&self, op: ClusterOp) -> ClusterReply;
}

/// Membership and remote invocation consumed by the dispatch engine
///
/// Implementors provide [`members`](Self::members) and
/// [`invoke`](Self::invoke). The fan-out helpers are built on top of those
/// and are optimistic: a member whose call fails is logged and left out of
/// the result instead of failing the whole fan-out.
#[async_trait]
pub trait ClusterCoordinator: Send + Sync {
    /// Every currently known member, including this node
    async fn members(&self) -> Vec<MemberRef>;

    /// Invoke an operation on one member
    async fn invoke(&self, member: &MemberRef, op: ClusterOp)
        -> Result<ClusterReply, ClusterError>;

    /// Invoke `op` on every member, keeping the successful replies
    async fn broadcast(&self, op: ClusterOp) -> Vec<MemberResponse<ClusterReply>> {
        let members = self.members().await;
        let calls = members.into_iter().map(|member| {
            let op = op.clone();
            async move {
                let result = self.invoke(&member, op).await;
                (member, result)
            }
        });

        let results = join_all(calls).await;
        let total = results.len();
        let replies: Vec<_> = results
            .into_iter()
            .filter_map(|(member, result)| match result {
                Ok(reply) => Some(MemberResponse::new(member, reply)),
                Err(e) => {
                    warn!(member = %member, op = op.name(), error = %e, "Member call failed, skipping");
                    None
                }
            })
            .collect();

        debug!(op = op.name(), total, answered = replies.len(), "Broadcast finished");
        replies
    }

    /// Members whose dispatch service reports itself started
    async fn ready_members(&self) -> Vec<MemberRef> {
        let mut ready: Vec<MemberRef> = self
            .broadcast(ClusterOp::IsMemberReady)
            .await
            .into_iter()
            .filter(|response| matches!(response.value, ClusterReply::Ready(true)))
            .map(|response| response.member)
            .collect();
        ready.sort();
        ready.dedup();
        ready
    }

    /// Oldest queued item time of every member that answered
    async fn oldest_task_timestamps(&self) -> Vec<MemberResponse<Option<i64>>> {
        self.broadcast(ClusterOp::GetOldestTaskTimestamp)
            .await
            .into_iter()
            .filter_map(|response| match response.value {
                ClusterReply::OldestTaskTimestamp(oldest) => {
                    Some(MemberResponse::new(response.member, oldest))
                }
                other => {
                    warn!(member = %response.member, reply = ?other, "Unexpected oldest timestamp reply");
                    None
                }
            })
            .collect()
    }

    /// Queue size of every member that answered
    async fn local_queue_sizes(&self) -> Vec<MemberResponse<usize>> {
        self.broadcast(ClusterOp::GetLocalQueueSize)
            .await
            .into_iter()
            .filter_map(|response| match response.value {
                ClusterReply::LocalQueueSize(size) => {
                    Some(MemberResponse::new(response.member, size))
                }
                other => {
                    warn!(member = %response.member, reply = ?other, "Unexpected queue size reply");
                    None
                }
            })
            .collect()
    }

    /// Round-trip time of a no-op call to `member`
    async fn ping_member(&self, member: &MemberRef) -> Result<Duration, ClusterError> {
        let started = Instant::now();
        match self.invoke(member, ClusterOp::Ping).await? {
            ClusterReply::Pong => Ok(started.elapsed()),
            reply => Err(ClusterError::UnexpectedReply {
                member: member.clone(),
                op: ClusterOp::Ping.name(),
                reply,
            }),
        }
    }
}
