//! The apply loop: folds committed entries into the local state machine.

use metrics::counter;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::state::PolicyState;
use crate::consensus::{ApplyWaiters, Consensus, LogIndex};

/// One node's copy of the ACL tables plus its apply progress.
pub struct Replica {
    state: Arc<RwLock<PolicyState>>,
    applied_tx: watch::Sender<LogIndex>,
    waiters: Arc<ApplyWaiters>,
}

impl Replica {
    pub fn new(waiters: Arc<ApplyWaiters>) -> Self {
        let (applied_tx, _) = watch::channel(0);
        Self {
            state: Arc::new(RwLock::new(PolicyState::new())),
            applied_tx,
            waiters,
        }
    }

    pub fn state(&self) -> &Arc<RwLock<PolicyState>> {
        &self.state
    }

    /// Applied-index notifications.
    pub fn applied(&self) -> watch::Receiver<LogIndex> {
        self.applied_tx.subscribe()
    }

    pub fn applied_index(&self) -> LogIndex {
        *self.applied_tx.borrow()
    }

    /// Apply every committed entry not yet applied. Returns how many were.
    pub fn catch_up(&self, consensus: &dyn Consensus) -> usize {
        let from = self.state.read().applied_index() + 1;
        let entries = consensus.entries_from(from);
        let mut count = 0;

        for entry in &entries {
            // Publishing under the write lock keeps the index monotonic.
            let outcome = {
                let mut state = self.state.write();
                let outcome = state.apply(entry);
                if outcome.is_some() {
                    self.applied_tx.send_replace(entry.index);
                }
                outcome
            };
            let Some(outcome) = outcome else { continue };
            count += 1;

            counter!(
                "bastion_apply_total",
                "op" => entry.command.kind(),
                "result" => if outcome.is_ok() { "ok" } else { "rejected" },
            )
            .increment(1);

            self.waiters.complete(entry.request_id, entry.index, outcome);
        }
        count
    }

    /// Run the apply loop until `shutdown` fires.
    pub fn spawn(self: Arc<Self>, consensus: Arc<dyn Consensus>, shutdown: CancellationToken) -> JoinHandle<()> {
        let mut commits = consensus.commits();
        tokio::spawn(async move {
            info!(node = consensus.node_id(), "Apply loop started");
            loop {
                let applied = self.catch_up(consensus.as_ref());
                if applied > 0 {
                    debug!(node = consensus.node_id(), applied, index = self.applied_index(), "Caught up");
                }
                tokio::select! {
                    changed = commits.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
            info!(node = consensus.node_id(), "Apply loop stopped");
        })
    }
}
