//! In-process ClusterCoordinator

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::coordinator::{ClusterCoordinator, ClusterOpHandler};
use super::types::{ClusterError, ClusterOp, ClusterReply, MemberRef};
use crate::work::panic_message;

struct Registration {
    handler: Weak<dyn ClusterOpHandler>,
    reachable: bool,
}

/// Coordinator that routes operations to nodes living in the same process
///
/// Handlers are held weakly, so a node registered here can hold the cluster
/// without forming a reference cycle; a dropped node simply becomes
/// unreachable. Members can be marked unreachable to simulate partitions.
/// A handler that panics surfaces as [`ClusterError::Invocation`].
///
/// # Example
///
/// ```
/// use taskmesh_dispatch::cluster::{ClusterCoordinator, InMemoryCluster};
///
/// # #[tokio::main]
/// # async fn main() {
/// let cluster = InMemoryCluster::new();
/// assert!(cluster.members().await.is_empty());
/// # }
/// ```
pub struct InMemoryCluster {
    nodes: RwLock<BTreeMap<MemberRef, Registration>>,
    invoke_timeout: Option<Duration>,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(BTreeMap::new()),
            invoke_timeout: None,
        }
    }

    /// Fail calls that take longer than `timeout`
    pub fn with_invoke_timeout(mut self, timeout: Duration) -> Self {
        self.invoke_timeout = Some(timeout);
        self
    }

    /// Register a node under `member`, replacing any previous registration
    pub fn join<H>(&self, member: MemberRef, handler: &Arc<H>)
    where
        H: ClusterOpHandler + 'static,
    {
        let handler: Weak<H> = Arc::downgrade(handler);
        let handler: Weak<dyn ClusterOpHandler> = handler;
        info!(member = %member, "Member joined");
        self.nodes.write().insert(
            member,
            Registration {
                handler,
                reachable: true,
            },
        );
    }

    /// Remove a member; returns whether it was registered
    pub fn leave(&self, member: &MemberRef) -> bool {
        let removed = self.nodes.write().remove(member).is_some();
        if removed {
            info!(member = %member, "Member left");
        }
        removed
    }

    /// Simulate a partition (or heal it)
    pub fn set_reachable(&self, member: &MemberRef, reachable: bool) {
        if let Some(registration) = self.nodes.write().get_mut(member) {
            registration.reachable = reachable;
            debug!(member = %member, reachable, "Member reachability changed");
        }
    }

    fn handler_for(&self, member: &MemberRef) -> Result<Arc<dyn ClusterOpHandler>, ClusterError> {
        let nodes = self.nodes.read();
        nodes
            .get(member)
            .filter(|registration| registration.reachable)
            .and_then(|registration| registration.handler.upgrade())
            .ok_or_else(|| ClusterError::Unreachable(member.clone()))
    }
}

#[async_trait]
impl ClusterCoordinator for InMemoryCluster {
    async fn members(&self) -> Vec<MemberRef> {
        self.nodes.read().keys().cloned().collect()
    }

    async fn invoke(
        &self,
        member: &MemberRef,
        op: ClusterOp,
    ) -> Result<ClusterReply, ClusterError> {
        let handler = self.handler_for(member)?;
        let op_name = op.name();
        let call =
            AssertUnwindSafe(async move { handler.handle_cluster_op(op).await }).catch_unwind();

        let outcome = match self.invoke_timeout {
            Some(timeout) => tokio::time::timeout(timeout, call)
                .await
                .map_err(|_| ClusterError::Timeout {
                    member: member.clone(),
                    op: op_name,
                })?,
            None => call.await,
        };

        outcome.map_err(|panic| {
            let message = panic_message(panic.as_ref());
            warn!(member = %member, op = op_name, panic = %message, "Member handler panicked");
            ClusterError::Invocation {
                member: member.clone(),
                op: op_name,
                message,
            }
        })
    }
}
