//! Policy store: the client-facing ACL operations of one node.
//!
//! Every operation authenticates the caller before touching the target, so
//! a denied caller learns nothing about whether the target exists.
//! Mutations require `acl:write`, reads `acl:read`.

use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};
use uuid::Uuid;

use super::authorizer::{Authorizer, Decision, Resource};
use super::command::{Applied, Command};
use super::management::{bootstrap_command, GLOBAL_MANAGEMENT_ID};
use super::models::{
    normalize_datacenters, validate_name, validate_namespace, AccessorId, Policy, PolicyCreate,
    PolicyDraft, PolicyId, PolicyUpdate, Token, TokenCreate, TokenDraft, DEFAULT_NAMESPACE,
};
use super::replica::Replica;
use crate::consensus::WritePath;
use crate::consistency::{Consistency, QueryMeta, ReadPath};
use crate::error::{AclError, Result};
use crate::rules::{compile, AccessLevel, ResourceKind, RuleTree};
use crate::telemetry::OperationTimer;

fn timed_compile(rules: &str) -> Result<RuleTree> {
    let timer = OperationTimer::start("compile");
    let compiled = compile(rules);
    timer.finish();
    compiled
}

/// Shown instead of a token secret to callers without `acl:write`.
pub const HIDDEN_SECRET: &str = "<hidden>";

// ═══════════════════════════════════════════════════════════════════════════════
// Auth Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Caller identity and cancellation for one request.
#[derive(Clone)]
pub struct AuthContext {
    secret: String,
    cancel: CancellationToken,
}

impl AuthContext {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl std::fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthContext").field("secret", &"<redacted>").finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Policy Store
// ═══════════════════════════════════════════════════════════════════════════════

/// ACL operations served by one node.
pub struct PolicyStore {
    replica: Arc<Replica>,
    write_path: Arc<WritePath>,
    read_path: ReadPath,
    authorizer: Arc<Authorizer>,
}

impl PolicyStore {
    pub fn new(replica: Arc<Replica>, write_path: Arc<WritePath>, authorizer: Arc<Authorizer>) -> Self {
        Self {
            read_path: ReadPath::new(Arc::clone(&write_path)),
            replica,
            write_path,
            authorizer,
        }
    }

    fn require(&self, auth: &AuthContext, access: AccessLevel) -> Result<()> {
        self.authorizer
            .require(auth.secret(), &Resource::kind_level(ResourceKind::Acl), access)
    }

    async fn submit(&self, auth: &AuthContext, command: Command) -> Result<Applied> {
        let ctx = self.write_path.leader_context();
        self.write_path.submit(&ctx, command, auth.cancel_token()).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Policies
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a policy.
    #[instrument(skip(self, auth, input), fields(name = %input.name))]
    pub async fn create(&self, auth: &AuthContext, input: PolicyCreate) -> Result<Policy> {
        self.require(auth, AccessLevel::Write)?;

        validate_name(&input.name)?;
        let namespace = input.namespace.unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        validate_namespace(&namespace)?;
        let id = match input.id.as_deref() {
            Some(raw) => PolicyId::parse(raw)?,
            None => PolicyId::new(),
        };
        let datacenters = normalize_datacenters(&input.datacenters)?;
        let compiled = timed_compile(&input.rules)?;

        let draft = PolicyDraft {
            id,
            name: input.name,
            namespace,
            description: input.description,
            rules: input.rules,
            compiled,
            datacenters,
        };
        self.replica.state().read().check_create(&draft)?;

        let policy = self
            .submit(auth, Command::CreatePolicy { policy: draft })
            .await?
            .into_policy()?;
        info!(
            policy_id = %policy.id,
            name = %policy.name,
            index = policy.raft_index.create_index,
            "Policy created"
        );
        Ok(policy)
    }

    /// Read a policy by ID.
    pub async fn read(&self, auth: &AuthContext, id: &PolicyId, consistency: Consistency) -> Result<(Policy, QueryMeta)> {
        self.require(auth, AccessLevel::Read)?;
        let barrier = self.read_path.barrier(consistency, auth.cancel_token()).await?;

        let state = self.replica.state().read();
        let policy = state
            .policy(id)
            .cloned()
            .ok_or_else(|| AclError::not_found("policy", id.to_string()))?;
        Ok((policy, barrier.meta(state.applied_index())))
    }

    /// Read a policy by name; `None` namespace means the default one.
    pub async fn read_by_name(
        &self,
        auth: &AuthContext,
        namespace: Option<&str>,
        name: &str,
        consistency: Consistency,
    ) -> Result<(Policy, QueryMeta)> {
        self.require(auth, AccessLevel::Read)?;
        let barrier = self.read_path.barrier(consistency, auth.cancel_token()).await?;

        let namespace = namespace.unwrap_or(DEFAULT_NAMESPACE);
        let state = self.replica.state().read();
        let policy = state
            .policy_by_name(namespace, name)
            .cloned()
            .ok_or_else(|| AclError::not_found("policy", format!("{}/{}", namespace, name)))?;
        Ok((policy, barrier.meta(state.applied_index())))
    }

    /// List live policies ordered by ID.
    pub async fn list(&self, auth: &AuthContext, consistency: Consistency) -> Result<(Vec<Policy>, QueryMeta)> {
        self.require(auth, AccessLevel::Read)?;
        let barrier = self.read_path.barrier(consistency, auth.cancel_token()).await?;

        let state = self.replica.state().read();
        let policies = state.policies().cloned().collect();
        Ok((policies, barrier.meta(state.applied_index())))
    }

    /// Update a policy.
    ///
    /// The update is always guarded by a modify index: the caller's
    /// `expected_index` when given, otherwise the index of the snapshot the
    /// change was merged onto.
    #[instrument(skip(self, auth, update), fields(policy_id = %id))]
    pub async fn update(&self, auth: &AuthContext, id: &PolicyId, update: PolicyUpdate) -> Result<Policy> {
        self.require(auth, AccessLevel::Write)?;
        // Merge onto the leader's view, not whatever this replica has applied.
        self.read_path
            .barrier(Consistency::Default, auth.cancel_token())
            .await?;

        let current = self
            .replica
            .state()
            .read()
            .policy(id)
            .cloned()
            .ok_or_else(|| AclError::not_found("policy", id.to_string()))?;

        if let Some(name) = &update.name {
            validate_name(name)?;
        }
        let mut draft = current.to_draft();
        if let Some(name) = update.name {
            draft.name = name;
        }
        if let Some(description) = update.description {
            draft.description = description;
        }
        if let Some(rules) = update.rules {
            draft.compiled = timed_compile(&rules)?;
            draft.rules = rules;
        }
        if let Some(datacenters) = update.datacenters {
            draft.datacenters = normalize_datacenters(&datacenters)?;
        }

        let expected_index = update
            .expected_index
            .unwrap_or(current.raft_index.modify_index);
        self.replica
            .state()
            .read()
            .check_update(&draft, Some(expected_index))?;

        let policy = self
            .submit(
                auth,
                Command::UpdatePolicy {
                    policy: draft,
                    expected_index: Some(expected_index),
                },
            )
            .await?
            .into_policy()?;
        info!(
            policy_id = %policy.id,
            index = policy.raft_index.modify_index,
            "Policy updated"
        );
        Ok(policy)
    }

    /// Delete a policy. Deleting a missing policy succeeds; returns whether
    /// it existed.
    #[instrument(skip(self, auth), fields(policy_id = %id))]
    pub async fn delete(&self, auth: &AuthContext, id: &PolicyId) -> Result<bool> {
        self.require(auth, AccessLevel::Write)?;
        if *id == GLOBAL_MANAGEMENT_ID {
            return Err(AclError::invalid_input("The global-management policy cannot be deleted"));
        }

        match self.submit(auth, Command::DeletePolicy { id: *id }).await? {
            Applied::PolicyDeleted { existed, .. } => {
                info!(policy_id = %id, existed, "Policy deleted");
                Ok(existed)
            }
            other => Err(AclError::internal(format!("unexpected delete result {:?}", other))),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Tokens
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a token bound to existing policies.
    #[instrument(skip(self, auth, input), fields(policies = input.policies.len(), local = input.local))]
    pub async fn create_token(&self, auth: &AuthContext, input: TokenCreate) -> Result<Token> {
        self.require(auth, AccessLevel::Write)?;

        let now = Utc::now();
        let expiration_time = match input.expiration_ttl {
            Some(ttl) => {
                let ttl = chrono::Duration::from_std(ttl)
                    .map_err(|e| AclError::invalid_input(format!("Token TTL out of range: {}", e)))?;
                Some(now + ttl)
            }
            None => None,
        };
        let mut policies = input.policies;
        policies.sort();
        policies.dedup();

        let draft = TokenDraft {
            accessor_id: AccessorId::new(),
            secret_id: input.secret_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            description: input.description,
            policies,
            local: input.local,
            datacenter: self.authorizer.datacenter().to_string(),
            create_time: now,
            expiration_time,
        };
        self.replica.state().read().check_token(&draft)?;

        let token = self
            .submit(auth, Command::CreateToken { token: draft })
            .await?
            .into_token()?;
        info!(accessor_id = %token.accessor_id, "Token created");
        Ok(token)
    }

    /// Read a token. The secret is only revealed to `acl:write` holders.
    pub async fn read_token(
        &self,
        auth: &AuthContext,
        accessor_id: &AccessorId,
        consistency: Consistency,
    ) -> Result<(Token, QueryMeta)> {
        self.require(auth, AccessLevel::Read)?;
        let may_see_secret = self.authorizer.authorize(
            auth.secret(),
            &Resource::kind_level(ResourceKind::Acl),
            AccessLevel::Write,
        )? == Decision::Allow;
        let barrier = self.read_path.barrier(consistency, auth.cancel_token()).await?;

        let state = self.replica.state().read();
        let mut token = state
            .token(accessor_id)
            .cloned()
            .ok_or_else(|| AclError::not_found("token", accessor_id.to_string()))?;
        if !may_see_secret {
            token.secret_id = HIDDEN_SECRET.to_string();
        }
        Ok((token, barrier.meta(state.applied_index())))
    }

    /// Delete a token. Idempotent; returns whether it existed.
    #[instrument(skip(self, auth), fields(accessor_id = %accessor_id))]
    pub async fn delete_token(&self, auth: &AuthContext, accessor_id: &AccessorId) -> Result<bool> {
        self.require(auth, AccessLevel::Write)?;
        match self
            .submit(auth, Command::DeleteToken { accessor_id: *accessor_id })
            .await?
        {
            Applied::TokenDeleted { existed, .. } => Ok(existed),
            other => Err(AclError::internal(format!("unexpected delete result {:?}", other))),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Bootstrap
    // ─────────────────────────────────────────────────────────────────────────

    /// Install the global-management policy and return the first management
    /// token. Succeeds once per cluster; later calls fail with `Conflict`.
    #[instrument(skip(self, secret, cancel))]
    pub async fn bootstrap(&self, secret: Option<String>, cancel: &CancellationToken) -> Result<Token> {
        if self.replica.state().read().is_bootstrapped() {
            return Err(AclError::conflict("ACL system is already bootstrapped"));
        }
        let command = bootstrap_command(secret, self.authorizer.datacenter())?;
        let ctx = self.write_path.leader_context();

        match self.write_path.submit(&ctx, command, cancel).await? {
            Applied::Bootstrapped { token, policy } => {
                info!(
                    accessor_id = %token.accessor_id,
                    policy_id = %policy.id,
                    "ACL system bootstrapped"
                );
                Ok(token)
            }
            other => Err(AclError::internal(format!("unexpected bootstrap result {:?}", other))),
        }
    }

    pub fn authorizer(&self) -> &Arc<Authorizer> {
        &self.authorizer
    }
}
