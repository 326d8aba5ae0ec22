//! Node assembly: one replica, write path, authorizer and store per member.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::acl::{Authorizer, PolicyStore, Replica};
use crate::config::Config;
use crate::consensus::{
    ApplyWaiters, Consensus, Forwarder, LocalRouter, LogStorage, MemoryRaft, NodeId, WritePath,
};
use crate::error::{AclError, Result};
use crate::telemetry::OperationTimer;

/// Per-node settings.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub datacenter: String,
    pub apply_timeout: Duration,
    pub cache_capacity: usize,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            datacenter: "dc1".to_string(),
            apply_timeout: Duration::from_secs(10),
            cache_capacity: 4096,
        }
    }
}

impl From<&Config> for NodeOptions {
    fn from(config: &Config) -> Self {
        Self {
            datacenter: config.node.datacenter.to_lowercase(),
            apply_timeout: config.consensus.apply_timeout,
            cache_capacity: config.acl.cache_capacity,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Node
// ═══════════════════════════════════════════════════════════════════════════════

/// A running cluster member.
pub struct Node {
    id: NodeId,
    replica: Arc<Replica>,
    write_path: Arc<WritePath>,
    authorizer: Arc<Authorizer>,
    store: Arc<PolicyStore>,
    router: Arc<LocalRouter>,
    shutdown: CancellationToken,
    apply_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    /// Replay the committed log, then start applying new commits.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(consensus: Arc<dyn Consensus>, router: Arc<LocalRouter>, options: &NodeOptions) -> Arc<Self> {
        let id: NodeId = consensus.node_id().to_string();
        let waiters = Arc::new(ApplyWaiters::new());
        let replica = Arc::new(Replica::new(Arc::clone(&waiters)));

        let timer = OperationTimer::start("replay");
        let replayed = replica.catch_up(consensus.as_ref());
        let elapsed = timer.finish();
        info!(
            node = %id,
            replayed,
            applied_index = replica.applied_index(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Replayed committed log"
        );

        let forwarder: Arc<dyn Forwarder> = router.clone();
        let write_path = Arc::new(WritePath::new(
            Arc::clone(&consensus),
            forwarder,
            waiters,
            replica.applied(),
            options.apply_timeout,
        ));
        router.register(id.clone(), &write_path);

        let authorizer = Arc::new(Authorizer::new(
            Arc::clone(replica.state()),
            options.datacenter.clone(),
            options.cache_capacity,
        ));
        let store = Arc::new(PolicyStore::new(
            Arc::clone(&replica),
            Arc::clone(&write_path),
            Arc::clone(&authorizer),
        ));

        let shutdown = CancellationToken::new();
        let apply_loop = Arc::clone(&replica).spawn(consensus, shutdown.child_token());

        Arc::new(Self {
            id,
            replica,
            write_path,
            authorizer,
            store,
            router,
            shutdown,
            apply_loop: Mutex::new(Some(apply_loop)),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    pub fn authorizer(&self) -> &Arc<Authorizer> {
        &self.authorizer
    }

    pub fn replica(&self) -> &Arc<Replica> {
        &self.replica
    }

    pub fn write_path(&self) -> &Arc<WritePath> {
        &self.write_path
    }

    /// Stop the apply loop and leave the router. Idempotent.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.router.deregister(&self.id);

        let handle = self.apply_loop.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(node = %self.id, error = %e, "Apply loop ended abnormally");
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Local Cluster
// ═══════════════════════════════════════════════════════════════════════════════

/// Every member of a [`MemoryRaft`] cluster running in this process.
pub struct LocalCluster {
    raft: Arc<MemoryRaft>,
    router: Arc<LocalRouter>,
    nodes: Vec<Arc<Node>>,
}

impl LocalCluster {
    /// Open `storage`, then start one node per member. No leader is elected.
    pub fn start<I, S>(members: I, storage: Arc<dyn LogStorage>, options: &NodeOptions) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        let members: Vec<NodeId> = members.into_iter().map(Into::into).collect();
        if members.is_empty() {
            return Err(AclError::configuration("A cluster needs at least one member"));
        }

        let raft = MemoryRaft::open(members.iter().cloned(), storage)?;
        let router = LocalRouter::new();
        let nodes = members
            .iter()
            .map(|id| {
                let consensus: Arc<dyn Consensus> = Arc::new(raft.node(id.clone()));
                Node::start(consensus, Arc::clone(&router), options)
            })
            .collect();

        Ok(Self { raft, router, nodes })
    }

    /// A cluster with volatile storage.
    pub fn in_memory<I, S>(members: I, options: &NodeOptions) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        Self::start(members, Arc::new(crate::consensus::MemoryStorage::new()), options)
    }

    pub fn raft(&self) -> &Arc<MemoryRaft> {
        &self.raft
    }

    pub fn router(&self) -> &Arc<LocalRouter> {
        &self.router
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn node(&self, id: &str) -> Result<&Arc<Node>> {
        self.nodes
            .iter()
            .find(|n| n.id() == id)
            .ok_or_else(|| AclError::not_found("Node", id))
    }

    /// The node currently holding leadership, if any.
    pub fn leader(&self) -> Option<&Arc<Node>> {
        let leader = self.raft.current().leader?;
        self.nodes.iter().find(|n| n.id() == leader)
    }

    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown().await;
        }
        info!(nodes = self.nodes.len(), "Local cluster stopped");
    }
}
