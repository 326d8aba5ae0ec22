//! The consensus primitive and its in-process implementation.
//!
//! [`Consensus`] is the only surface the write and read paths use: propose
//! under a term, observe commits, observe leadership, verify leadership.
//! [`MemoryRaft`] implements it for a set of in-process members. Leadership
//! is driven from outside (`elect` / `step_down`); member health decides
//! whether proposals reach quorum.

use async_trait::async_trait;
use metrics::gauge;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::log::{LogEntry, LogStorage, MemoryStorage};
use super::{LogIndex, NodeId, Term};
use crate::acl::Command;
use crate::error::{AclError, ErrorCode, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Consensus Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Who leads, and in which term.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Leadership {
    pub term: Term,
    pub leader: Option<NodeId>,
}

/// A node's view of the replicated log.
#[async_trait]
pub trait Consensus: Send + Sync {
    /// This member's identity.
    fn node_id(&self) -> &str;

    /// Append a command as leader of `term`. Returns the assigned index.
    ///
    /// The entry is committed once a quorum has it; the returned index does
    /// not imply commitment.
    async fn propose(&self, term: Term, request_id: Uuid, command: Command) -> Result<LogIndex>;

    /// Highest committed index.
    fn commit_index(&self) -> LogIndex;

    /// Committed entries with index `>= from`, in order.
    fn entries_from(&self, from: LogIndex) -> Vec<LogEntry>;

    /// Leadership changes.
    fn leadership(&self) -> watch::Receiver<Leadership>;

    /// Commit index changes.
    fn commits(&self) -> watch::Receiver<LogIndex>;

    /// Confirm this member still leads `term` with a reachable quorum.
    async fn verify_leader(&self, term: Term) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Memory Raft
// ═══════════════════════════════════════════════════════════════════════════════

struct RaftState {
    term: Term,
    leader: Option<NodeId>,
    /// Members and whether each currently acknowledges replication.
    members: BTreeMap<NodeId, bool>,
    /// Committed entries; `log[i].index == i + 1`.
    log: Vec<LogEntry>,
    /// Proposed entries awaiting quorum.
    pending: VecDeque<LogEntry>,
}

impl RaftState {
    fn last_index(&self) -> LogIndex {
        self.log.len() as LogIndex + self.pending.len() as LogIndex
    }

    fn commit_index(&self) -> LogIndex {
        self.log.len() as LogIndex
    }

    fn has_quorum(&self) -> bool {
        let healthy = self.members.values().filter(|h| **h).count();
        healthy * 2 > self.members.len()
    }

    fn leadership(&self) -> Leadership {
        Leadership {
            term: self.term,
            leader: self.leader.clone(),
        }
    }
}

/// In-process replicated log shared by a set of members.
pub struct MemoryRaft {
    state: Mutex<RaftState>,
    storage: Arc<dyn LogStorage>,
    leadership_tx: watch::Sender<Leadership>,
    commit_tx: watch::Sender<LogIndex>,
}

impl MemoryRaft {
    /// A cluster with volatile storage. All members start healthy.
    pub fn new<I, S>(members: I) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        Self::build(members, Arc::new(MemoryStorage::new()), Vec::new())
    }

    /// A cluster backed by `storage`, reloading every committed entry.
    pub fn open<I, S>(members: I, storage: Arc<dyn LogStorage>) -> Result<Arc<Self>>
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        let log = storage.load()?;
        info!(entries = log.len(), "Recovered committed log");
        Ok(Self::build(members, storage, log))
    }

    fn build<I, S>(members: I, storage: Arc<dyn LogStorage>, log: Vec<LogEntry>) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        let term = log.last().map_or(0, |e| e.term);
        let commit = log.len() as LogIndex;
        let state = RaftState {
            term,
            leader: None,
            members: members.into_iter().map(|m| (m.into(), true)).collect(),
            log,
            pending: VecDeque::new(),
        };
        let (leadership_tx, _) = watch::channel(state.leadership());
        let (commit_tx, _) = watch::channel(commit);

        Arc::new(Self {
            state: Mutex::new(state),
            storage,
            leadership_tx,
            commit_tx,
        })
    }

    /// Handle for one member.
    pub fn node(self: &Arc<Self>, id: impl Into<NodeId>) -> RaftNode {
        RaftNode {
            id: id.into(),
            raft: Arc::clone(self),
        }
    }

    /// Make `node` leader of a new term.
    pub fn elect(&self, node: &str) -> Result<Term> {
        let mut state = self.state.lock();
        if !state.members.contains_key(node) {
            return Err(AclError::invalid_input(format!("{} is not a cluster member", node)));
        }
        state.term += 1;
        state.leader = Some(node.to_string());
        info!(leader = node, term = state.term, "Leader elected");
        self.leadership_tx.send_replace(state.leadership());
        gauge!("bastion_raft_term").set(state.term as f64);
        Ok(state.term)
    }

    /// Leave the cluster leaderless until the next election.
    pub fn step_down(&self) {
        let mut state = self.state.lock();
        if let Some(old) = state.leader.take() {
            info!(leader = %old, term = state.term, "Leader stepped down");
            self.leadership_tx.send_replace(state.leadership());
        }
    }

    /// Mark a member reachable or unreachable. Pending entries commit as
    /// soon as a quorum is healthy again.
    pub fn set_healthy(&self, node: &str, healthy: bool) -> Result<()> {
        let mut state = self.state.lock();
        match state.members.get_mut(node) {
            Some(flag) => *flag = healthy,
            None => return Err(AclError::invalid_input(format!("{} is not a cluster member", node))),
        }
        debug!(node, healthy, "Member health changed");
        self.try_commit(&mut state)
    }

    pub fn current(&self) -> Leadership {
        self.state.lock().leadership()
    }

    fn try_commit(&self, state: &mut RaftState) -> Result<()> {
        if !state.has_quorum() {
            if !state.pending.is_empty() {
                warn!(pending = state.pending.len(), "No quorum, entries held");
            }
            return Ok(());
        }
        let before = state.commit_index();
        while let Some(entry) = state.pending.pop_front() {
            if let Err(e) = self.storage.append(&entry) {
                state.pending.push_front(entry);
                self.publish_commit(state, before);
                return Err(e);
            }
            state.log.push(entry);
        }
        self.publish_commit(state, before);
        Ok(())
    }

    fn publish_commit(&self, state: &RaftState, before: LogIndex) {
        let commit = state.commit_index();
        if commit > before {
            debug!(commit_index = commit, "Entries committed");
            gauge!("bastion_commit_index").set(commit as f64);
            self.commit_tx.send_replace(commit);
        }
    }

    fn propose_as(&self, node: &str, term: Term, request_id: Uuid, command: Command) -> Result<LogIndex> {
        let mut state = self.state.lock();
        match state.leader.as_deref() {
            None => return Err(AclError::no_leader()),
            Some(leader) if leader != node || state.term != term => {
                return Err(AclError::not_leader_anymore(term, state.term, Some(leader)));
            }
            Some(_) => {}
        }

        let index = state.last_index() + 1;
        state.pending.push_back(LogEntry {
            index,
            term,
            request_id,
            command,
        });
        self.try_commit(&mut state)?;
        Ok(index)
    }

    fn verify_as(&self, node: &str, term: Term) -> Result<()> {
        let state = self.state.lock();
        match state.leader.as_deref() {
            None => Err(AclError::no_leader()),
            Some(leader) if leader != node || state.term != term => {
                Err(AclError::not_leader_anymore(term, state.term, Some(leader)))
            }
            Some(_) if !state.has_quorum() => Err(AclError::new(
                ErrorCode::NoLeader,
                "Leader cannot reach a quorum",
            )),
            Some(_) => Ok(()),
        }
    }
}

/// One member's handle on a [`MemoryRaft`].
#[derive(Clone)]
pub struct RaftNode {
    id: NodeId,
    raft: Arc<MemoryRaft>,
}

impl RaftNode {
    pub fn cluster(&self) -> &Arc<MemoryRaft> {
        &self.raft
    }
}

#[async_trait]
impl Consensus for RaftNode {
    fn node_id(&self) -> &str {
        &self.id
    }

    #[instrument(skip(self, command), fields(node = %self.id, op = command.kind()))]
    async fn propose(&self, term: Term, request_id: Uuid, command: Command) -> Result<LogIndex> {
        self.raft.propose_as(&self.id, term, request_id, command)
    }

    fn commit_index(&self) -> LogIndex {
        self.raft.state.lock().commit_index()
    }

    fn entries_from(&self, from: LogIndex) -> Vec<LogEntry> {
        let state = self.raft.state.lock();
        let start = from.saturating_sub(1) as usize;
        state.log.get(start..).map(<[LogEntry]>::to_vec).unwrap_or_default()
    }

    fn leadership(&self) -> watch::Receiver<Leadership> {
        self.raft.leadership_tx.subscribe()
    }

    fn commits(&self) -> watch::Receiver<LogIndex> {
        self.raft.commit_tx.subscribe()
    }

    async fn verify_leader(&self, term: Term) -> Result<()> {
        self.raft.verify_as(&self.id, term)
    }
}
