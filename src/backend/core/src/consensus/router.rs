//! In-process forwarding between members of one cluster.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::write_path::{Forwarder, WritePath};
use super::{LogIndex, NodeId, Term};
use crate::acl::{Applied, Command};
use crate::error::{AclError, ErrorCode, Result};

/// Routes forwarded requests to the write path of the target member.
#[derive(Default)]
pub struct LocalRouter {
    nodes: DashMap<NodeId, Weak<WritePath>>,
}

impl LocalRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, node: impl Into<NodeId>, path: &Arc<WritePath>) {
        self.nodes.insert(node.into(), Arc::downgrade(path));
    }

    pub fn deregister(&self, node: &str) {
        self.nodes.remove(node);
    }

    fn lookup(&self, node: &str) -> Result<Arc<WritePath>> {
        self.nodes
            .get(node)
            .and_then(|w| w.upgrade())
            .ok_or_else(|| AclError::new(ErrorCode::NoLeader, format!("Leader {} is unreachable", node)))
    }
}

#[async_trait]
impl Forwarder for LocalRouter {
    async fn forward_write(
        &self,
        leader: &str,
        term: Term,
        request_id: Uuid,
        command: Command,
    ) -> Result<(LogIndex, Applied)> {
        let path = self.lookup(leader)?;
        debug!(leader, term, %request_id, "Routing forwarded write");
        // The follower's cancellation only covers its own wait.
        path.submit_as_leader(term, request_id, command, &CancellationToken::new())
            .await
    }

    async fn read_index(&self, leader: &str, term: Term, verify: bool) -> Result<LogIndex> {
        self.lookup(leader)?.read_index(term, verify).await
    }
}
