//! Leader routing and commit waiting for mutations.
//!
//! A write is accepted only once it is committed and applied. The submitting
//! node either proposes it itself (when it leads) or forwards it to the
//! leader and then waits until its own replica has caught up to the
//! returned index, so a caller always reads its own write locally.

use async_trait::async_trait;
use dashmap::DashMap;
use metrics::histogram;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::raft::{Consensus, Leadership};
use super::{LogIndex, NodeId, Term};
use crate::acl::{Applied, ApplyOutcome, Command};
use crate::error::{AclError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Leader Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Snapshot of leadership a request is routed by.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaderContext {
    pub term: Term,
    pub leader: Option<NodeId>,
}

impl From<Leadership> for LeaderContext {
    fn from(l: Leadership) -> Self {
        Self {
            term: l.term,
            leader: l.leader,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Forwarding
// ═══════════════════════════════════════════════════════════════════════════════

/// Reaches the leader from a follower.
#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Submit a write on `leader`. Returns the entry's index and the leader's
    /// apply result.
    async fn forward_write(
        &self,
        leader: &str,
        term: Term,
        request_id: Uuid,
        command: Command,
    ) -> Result<(LogIndex, Applied)>;

    /// Ask `leader` for its commit index, optionally confirming it still
    /// leads `term` with a quorum.
    async fn read_index(&self, leader: &str, term: Term, verify: bool) -> Result<LogIndex>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Apply Waiters
// ═══════════════════════════════════════════════════════════════════════════════

/// Pending submitters keyed by request ID, completed by the apply loop.
#[derive(Debug, Default)]
pub struct ApplyWaiters {
    waiters: DashMap<Uuid, oneshot::Sender<(LogIndex, ApplyOutcome)>>,
}

impl ApplyWaiters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, request_id: Uuid) -> oneshot::Receiver<(LogIndex, ApplyOutcome)> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(request_id, tx);
        rx
    }

    /// Hand an outcome to its waiter, if one is still registered here.
    pub fn complete(&self, request_id: Uuid, index: LogIndex, outcome: ApplyOutcome) {
        if let Some((_, tx)) = self.waiters.remove(&request_id) {
            // The receiver may have timed out already.
            let _ = tx.send((index, outcome));
        }
    }

    pub fn abandon(&self, request_id: &Uuid) {
        self.waiters.remove(request_id);
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Write Path
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-node write routing.
pub struct WritePath {
    consensus: Arc<dyn Consensus>,
    forwarder: Arc<dyn Forwarder>,
    waiters: Arc<ApplyWaiters>,
    applied: watch::Receiver<LogIndex>,
    apply_timeout: Duration,
}

impl WritePath {
    pub fn new(
        consensus: Arc<dyn Consensus>,
        forwarder: Arc<dyn Forwarder>,
        waiters: Arc<ApplyWaiters>,
        applied: watch::Receiver<LogIndex>,
        apply_timeout: Duration,
    ) -> Self {
        Self {
            consensus,
            forwarder,
            waiters,
            applied,
            apply_timeout,
        }
    }

    pub fn node_id(&self) -> &str {
        self.consensus.node_id()
    }

    pub fn consensus(&self) -> &Arc<dyn Consensus> {
        &self.consensus
    }

    /// Current leadership as this node sees it.
    pub fn leader_context(&self) -> LeaderContext {
        self.consensus.leadership().borrow().clone().into()
    }

    /// Highest index applied by the local replica.
    pub fn applied_index(&self) -> LogIndex {
        *self.applied.borrow()
    }

    /// Submit a command and wait for its applied result.
    ///
    /// On `Timeout` or `Cancelled` the entry may still commit later; callers
    /// should re-read before retrying.
    #[instrument(skip(self, command, cancel), fields(node = %self.node_id(), op = command.kind(), term = ctx.term))]
    pub async fn submit(&self, ctx: &LeaderContext, command: Command, cancel: &CancellationToken) -> Result<Applied> {
        let op = command.kind();
        let started = Instant::now();
        let request_id = Uuid::new_v4();

        let result = match ctx.leader.as_deref() {
            None => Err(AclError::no_leader()),
            Some(leader) if leader == self.node_id() => self
                .submit_as_leader(ctx.term, request_id, command, cancel)
                .await
                .map(|(_, applied)| applied),
            Some(leader) => {
                debug!(leader, %request_id, "Forwarding write to leader");
                match self.forwarder.forward_write(leader, ctx.term, request_id, command).await {
                    Ok((index, applied)) => self.wait_applied(index, cancel).await.map(|_| applied),
                    Err(e) => Err(e),
                }
            }
        };

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) if e.code().requires_reread() => "unknown",
            Err(_) => "rejected",
        };
        histogram!("bastion_write_duration_seconds", "op" => op, "outcome" => outcome)
            .record(started.elapsed().as_secs_f64());
        result
    }

    /// Propose as leader of `term` and wait for the local apply.
    pub async fn submit_as_leader(
        &self,
        term: Term,
        request_id: Uuid,
        command: Command,
        cancel: &CancellationToken,
    ) -> Result<(LogIndex, Applied)> {
        let rx = self.waiters.register(request_id);
        let index = match self.consensus.propose(term, request_id, command).await {
            Ok(index) => index,
            Err(e) => {
                self.waiters.abandon(&request_id);
                return Err(e);
            }
        };

        let (applied_index, outcome) = tokio::select! {
            received = rx => received.map_err(|_| AclError::internal("Apply loop stopped before the entry was applied"))?,
            _ = tokio::time::sleep(self.apply_timeout) => {
                self.waiters.abandon(&request_id);
                warn!(index, %request_id, "Timed out waiting for apply");
                return Err(AclError::timeout(format_args!("log entry {} to apply", index)));
            }
            _ = cancel.cancelled() => {
                self.waiters.abandon(&request_id);
                return Err(AclError::cancelled());
            }
        };
        outcome.map(|applied| (applied_index, applied))
    }

    /// Leader side of a read barrier.
    pub async fn read_index(&self, term: Term, verify: bool) -> Result<LogIndex> {
        let current = self.leader_context();
        if current.leader.as_deref() != Some(self.node_id()) || current.term != term {
            return Err(AclError::not_leader_anymore(term, current.term, current.leader.as_deref()));
        }
        if verify {
            self.consensus.verify_leader(term).await?;
        }
        Ok(self.consensus.commit_index())
    }

    /// Wait until the local replica has applied `index`.
    pub async fn wait_applied(&self, index: LogIndex, cancel: &CancellationToken) -> Result<()> {
        let mut applied = self.applied.clone();
        tokio::select! {
            reached = applied.wait_for(|i| *i >= index) => reached
                .map(|_| ())
                .map_err(|_| AclError::internal("Apply loop stopped")),
            _ = tokio::time::sleep(self.apply_timeout) => {
                Err(AclError::timeout(format_args!("local replica to apply index {}", index)))
            }
            _ = cancel.cancelled() => Err(AclError::cancelled()),
        }
    }

    pub(crate) fn forwarder(&self) -> &Arc<dyn Forwarder> {
        &self.forwarder
    }
}
