//! Read consistency levels and the read barrier that enforces them.
//!
//! | Level     | Leader required | Waits for leader commit | Verifies quorum |
//! |-----------|-----------------|-------------------------|-----------------|
//! | `stale`   | no              | no                      | no              |
//! | `default` | yes             | yes                     | no              |
//! | `strong`  | yes             | yes                     | yes             |

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, trace};

use crate::consensus::{LogIndex, WritePath};
use crate::error::{AclError, Result};

/// Requested read consistency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Consistency {
    /// Observe everything committed before the read started.
    #[default]
    Default,
    /// Serve from the local replica as-is.
    Stale,
    /// As `Default`, and the leader proves it still leads.
    Strong,
}

impl Consistency {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "default" | "" => Ok(Self::Default),
            "stale" => Ok(Self::Stale),
            "strong" | "consistent" => Ok(Self::Strong),
            other => Err(AclError::invalid_input(format!(
                "Unknown consistency {:?} (expected default, stale or strong)",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Stale => "stale",
            Self::Strong => "strong",
        }
    }
}

impl fmt::Display for Consistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata returned with every read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryMeta {
    /// Applied index the result reflects.
    pub index: LogIndex,
    pub known_leader: bool,
    pub consistency: Consistency,
}

/// Outcome of a passed barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Barrier {
    pub known_leader: bool,
    pub consistency: Consistency,
}

impl Barrier {
    /// Stamp a read taken at `index`.
    pub fn meta(&self, index: LogIndex) -> QueryMeta {
        QueryMeta {
            index,
            known_leader: self.known_leader,
            consistency: self.consistency,
        }
    }
}

/// Read barrier for one node.
pub struct ReadPath {
    path: Arc<WritePath>,
}

impl ReadPath {
    pub fn new(path: Arc<WritePath>) -> Self {
        Self { path }
    }

    /// Block until the local replica may serve a read at `consistency`.
    #[instrument(skip(self, cancel), fields(node = %self.path.node_id(), consistency = %consistency))]
    pub async fn barrier(&self, consistency: Consistency, cancel: &CancellationToken) -> Result<Barrier> {
        let ctx = self.path.leader_context();
        let known_leader = ctx.leader.is_some();

        if consistency == Consistency::Stale {
            return Ok(Barrier {
                known_leader,
                consistency,
            });
        }

        let leader = ctx.leader.as_deref().ok_or_else(AclError::no_leader)?;
        let verify = consistency == Consistency::Strong;
        let commit = if leader == self.path.node_id() {
            self.path.read_index(ctx.term, verify).await?
        } else {
            self.path.forwarder().read_index(leader, ctx.term, verify).await?
        };
        trace!(commit, "Read index obtained");
        self.path.wait_applied(commit, cancel).await?;

        Ok(Barrier {
            known_leader,
            consistency,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!(Consistency::parse("stale").unwrap(), Consistency::Stale);
        assert_eq!(Consistency::parse("").unwrap(), Consistency::Default);
        assert_eq!(Consistency::parse("strong").unwrap(), Consistency::Strong);
        assert!(Consistency::parse("eventual").is_err());
    }

    #[test]
    fn test_default_level() {
        assert_eq!(Consistency::default(), Consistency::Default);
        assert_eq!(serde_json::to_string(&Consistency::Strong).unwrap(), "\"strong\"");
    }
}
