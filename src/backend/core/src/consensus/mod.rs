//! Replicated log and the write path built on it.
//!
//! - **Log**: committed entries and durable storage (memory, JSON lines)
//! - **Raft**: the `Consensus` primitive and its in-process implementation
//! - **Write Path**: leader routing, forwarding, commit/apply waiting
//! - **Router**: in-process `Forwarder` between cluster members

pub mod log;
pub mod raft;
pub mod router;
pub mod write_path;

/// Position in the replicated log. The first entry has index 1.
pub type LogIndex = u64;

/// Leadership term. Increases with every election.
pub type Term = u64;

/// Cluster member identity.
pub type NodeId = String;

pub use log::{FileStorage, LogEntry, LogStorage, MemoryStorage};
pub use raft::{Consensus, Leadership, MemoryRaft, RaftNode};
pub use router::LocalRouter;
pub use write_path::{ApplyWaiters, Forwarder, LeaderContext, WritePath};
