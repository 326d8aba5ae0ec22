//! The replicated ACL state machine.
//!
//! Entries are folded in log order. Application is deterministic: given the
//! same committed log every replica reaches the same tables and produces the
//! same outcome for every entry. Validation that depends on current state
//! (name uniqueness, ID reuse, compare-and-swap) is repeated here, so two
//! racing writes that both passed the pre-submit checks still resolve to
//! exactly one winner.

use std::collections::{BTreeMap, HashMap};
use tracing::{debug, trace};

use super::command::{Applied, ApplyOutcome, Command};
use super::management::GLOBAL_MANAGEMENT_ID;
use super::models::{AccessorId, Policy, PolicyDraft, PolicyId, RaftIndex, Token, TokenDraft};
use crate::consensus::{LogEntry, LogIndex};
use crate::error::{AclError, Result};

/// Point-in-time ACL tables of one replica.
#[derive(Debug, Clone, Default)]
pub struct PolicyState {
    policies: BTreeMap<PolicyId, Policy>,
    /// `(namespace, name)` of every live policy.
    names: HashMap<(String, String), PolicyId>,
    /// Deleted policy IDs and the index that deleted them.
    tombstones: HashMap<PolicyId, LogIndex>,
    tokens: BTreeMap<AccessorId, Token>,
    secrets: HashMap<String, AccessorId>,
    bootstrapped: bool,
    applied_index: LogIndex,
}

impl PolicyState {
    pub fn new() -> Self {
        Self::default()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    pub fn applied_index(&self) -> LogIndex {
        self.applied_index
    }

    pub fn policy(&self, id: &PolicyId) -> Option<&Policy> {
        self.policies.get(id)
    }

    pub fn policy_by_name(&self, namespace: &str, name: &str) -> Option<&Policy> {
        self.names
            .get(&(namespace.to_string(), name.to_string()))
            .and_then(|id| self.policies.get(id))
    }

    /// Live policies ordered by ID.
    pub fn policies(&self) -> impl Iterator<Item = &Policy> {
        self.policies.values()
    }

    pub fn is_tombstoned(&self, id: &PolicyId) -> bool {
        self.tombstones.contains_key(id)
    }

    pub fn token(&self, accessor_id: &AccessorId) -> Option<&Token> {
        self.tokens.get(accessor_id)
    }

    pub fn token_by_secret(&self, secret: &str) -> Option<&Token> {
        self.secrets.get(secret).and_then(|a| self.tokens.get(a))
    }

    pub fn tokens(&self) -> impl Iterator<Item = &Token> {
        self.tokens.values()
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrapped
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Checks shared by the submit path and apply
    // ─────────────────────────────────────────────────────────────────────────

    /// A new policy must use a fresh ID and a free name.
    pub fn check_create(&self, draft: &PolicyDraft) -> Result<()> {
        if self.policies.contains_key(&draft.id) {
            return Err(AclError::conflict(format!("Policy ID {} already exists", draft.id))
                .with_context("policy_id", draft.id.to_string()));
        }
        if self.tombstones.contains_key(&draft.id) {
            return Err(AclError::conflict(format!(
                "Policy ID {} belonged to a deleted policy and cannot be reused",
                draft.id
            ))
            .with_context("policy_id", draft.id.to_string()));
        }
        self.check_name_free(draft, None)
    }

    /// An update must target a live policy, pass the CAS guard, and keep the
    /// name unique.
    pub fn check_update(&self, draft: &PolicyDraft, expected_index: Option<u64>) -> Result<&Policy> {
        let current = self
            .policies
            .get(&draft.id)
            .ok_or_else(|| AclError::not_found("policy", draft.id.to_string()))?;

        if let Some(expected) = expected_index {
            if current.raft_index.modify_index != expected {
                return Err(AclError::conflict(format!(
                    "Policy {} was modified at index {} (expected {})",
                    draft.id, current.raft_index.modify_index, expected
                ))
                .with_context("modify_index", current.raft_index.modify_index));
            }
        }
        if draft.id == GLOBAL_MANAGEMENT_ID && draft.name != current.name {
            return Err(AclError::invalid_input("The global-management policy cannot be renamed"));
        }
        self.check_name_free(draft, Some(draft.id))?;
        Ok(current)
    }

    fn check_name_free(&self, draft: &PolicyDraft, owner: Option<PolicyId>) -> Result<()> {
        match self.names.get(&(draft.namespace.clone(), draft.name.clone())) {
            Some(existing) if Some(*existing) != owner => Err(AclError::conflict(format!(
                "A policy named {:?} already exists in namespace {:?}",
                draft.name, draft.namespace
            ))
            .with_context("policy_id", existing.to_string())),
            _ => Ok(()),
        }
    }

    pub fn check_token(&self, draft: &TokenDraft) -> Result<()> {
        if self.tokens.contains_key(&draft.accessor_id) {
            return Err(AclError::conflict(format!("Token {} already exists", draft.accessor_id)));
        }
        if self.secrets.contains_key(&draft.secret_id) {
            return Err(AclError::conflict("Token secret is already in use"));
        }
        for id in &draft.policies {
            if !self.policies.contains_key(id) {
                return Err(AclError::not_found("policy", id.to_string()));
            }
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Apply
    // ─────────────────────────────────────────────────────────────────────────

    /// Apply one committed entry.
    ///
    /// Returns `None` for entries at or below the applied index, which makes
    /// replays and duplicate deliveries harmless.
    pub fn apply(&mut self, entry: &LogEntry) -> Option<ApplyOutcome> {
        if entry.index <= self.applied_index {
            trace!(index = entry.index, applied = self.applied_index, "Skipping applied entry");
            return None;
        }
        let outcome = self.apply_command(entry.index, &entry.command);
        self.applied_index = entry.index;
        debug!(
            index = entry.index,
            op = entry.command.kind(),
            ok = outcome.is_ok(),
            "Applied entry"
        );
        Some(outcome)
    }

    fn apply_command(&mut self, index: LogIndex, command: &Command) -> ApplyOutcome {
        match command {
            Command::CreatePolicy { policy } => {
                self.check_create(policy)?;
                Ok(Applied::Policy(self.insert_policy(policy.clone(), index)))
            }
            Command::UpdatePolicy {
                policy,
                expected_index,
            } => {
                let current = self.check_update(policy, *expected_index)?;
                let raft_index = RaftIndex {
                    create_index: current.raft_index.create_index,
                    modify_index: index,
                };
                let old_key = (current.namespace.clone(), current.name.clone());
                self.names.remove(&old_key);
                let updated = policy.clone().into_policy(raft_index);
                self.names
                    .insert((updated.namespace.clone(), updated.name.clone()), updated.id);
                self.policies.insert(updated.id, updated.clone());
                Ok(Applied::Policy(updated))
            }
            Command::DeletePolicy { id } => {
                if *id == GLOBAL_MANAGEMENT_ID {
                    return Err(AclError::invalid_input(
                        "The global-management policy cannot be deleted",
                    ));
                }
                let existed = match self.policies.remove(id) {
                    Some(policy) => {
                        self.names.remove(&(policy.namespace, policy.name));
                        self.tombstones.insert(*id, index);
                        true
                    }
                    None => false,
                };
                Ok(Applied::PolicyDeleted { id: *id, existed })
            }
            Command::CreateToken { token } => {
                self.check_token(token)?;
                Ok(Applied::Token(self.insert_token(token.clone(), index)))
            }
            Command::DeleteToken { accessor_id } => {
                let existed = match self.tokens.remove(accessor_id) {
                    Some(token) => {
                        self.secrets.remove(&token.secret_id);
                        true
                    }
                    None => false,
                };
                Ok(Applied::TokenDeleted {
                    accessor_id: *accessor_id,
                    existed,
                })
            }
            Command::Bootstrap { policy, token } => {
                if self.bootstrapped {
                    return Err(AclError::conflict("ACL system is already bootstrapped"));
                }
                let existing = self.policies.get(&policy.id).cloned();
                if existing.is_none() {
                    self.check_create(policy)?;
                }
                if self.tokens.contains_key(&token.accessor_id) || self.secrets.contains_key(&token.secret_id) {
                    return Err(AclError::conflict("Bootstrap token is already in use"));
                }
                let policy = match existing {
                    Some(existing) => existing,
                    None => self.insert_policy(policy.clone(), index),
                };
                let token = self.insert_token(token.clone(), index);
                self.bootstrapped = true;
                Ok(Applied::Bootstrapped { policy, token })
            }
        }
    }

    fn insert_policy(&mut self, draft: PolicyDraft, index: LogIndex) -> Policy {
        let policy = draft.into_policy(RaftIndex {
            create_index: index,
            modify_index: index,
        });
        self.names
            .insert((policy.namespace.clone(), policy.name.clone()), policy.id);
        self.policies.insert(policy.id, policy.clone());
        policy
    }

    fn insert_token(&mut self, draft: TokenDraft, index: LogIndex) -> Token {
        let token = draft.into_token(RaftIndex {
            create_index: index,
            modify_index: index,
        });
        self.secrets.insert(token.secret_id.clone(), token.accessor_id);
        self.tokens.insert(token.accessor_id, token.clone());
        token
    }
}
