//! Data models for the ACL tables: policies, tokens and their write inputs.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::OnceLock;
use uuid::Uuid;

use crate::error::{AclError, Result};
use crate::rules::RuleTree;

/// Namespace used when a write does not name one.
pub const DEFAULT_NAMESPACE: &str = "default";

// ═══════════════════════════════════════════════════════════════════════════════
// Identifiers
// ═══════════════════════════════════════════════════════════════════════════════

/// Stable, immutable identifier of a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PolicyId(pub Uuid);

impl PolicyId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a caller-supplied ID.
    pub fn parse(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| AclError::invalid_input(format!("Policy ID {:?} is not a valid UUID", s)).with_source(e))
    }
}

impl Default for PolicyId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Public identifier of a token. The secret is never used as an identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccessorId(pub Uuid);

impl AccessorId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| AclError::invalid_input(format!("Accessor ID {:?} is not a valid UUID", s)).with_source(e))
    }
}

impl Default for AccessorId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AccessorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Log positions of a record's creation and latest modification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftIndex {
    pub create_index: u64,
    pub modify_index: u64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Validation
// ═══════════════════════════════════════════════════════════════════════════════

static NAME_RE: OnceLock<Regex> = OnceLock::new();
static DATACENTER_RE: OnceLock<Regex> = OnceLock::new();

fn name_re() -> &'static Regex {
    NAME_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{1,128}$").expect("valid name pattern"))
}

fn datacenter_re() -> &'static Regex {
    DATACENTER_RE.get_or_init(|| Regex::new(r"^(?i)[a-z0-9_-]{1,64}$").expect("valid datacenter pattern"))
}

/// Validate a policy name.
pub fn validate_name(name: &str) -> Result<()> {
    if name_re().is_match(name) {
        Ok(())
    } else {
        Err(AclError::invalid_input(format!(
            "Invalid policy name {:?}: must be 1-128 characters of [A-Za-z0-9_-]",
            name
        )))
    }
}

/// Validate a namespace; namespaces share the policy name alphabet.
pub fn validate_namespace(namespace: &str) -> Result<()> {
    if name_re().is_match(namespace) {
        Ok(())
    } else {
        Err(AclError::invalid_input(format!("Invalid namespace {:?}", namespace)))
    }
}

/// Validate and normalize a datacenter list: lowercased, sorted, deduplicated.
pub fn normalize_datacenters(datacenters: &[String]) -> Result<Vec<String>> {
    let mut out = Vec::with_capacity(datacenters.len());
    for dc in datacenters {
        if !datacenter_re().is_match(dc) {
            return Err(AclError::invalid_input(format!("Invalid datacenter name {:?}", dc)));
        }
        out.push(dc.to_ascii_lowercase());
    }
    out.sort();
    out.dedup();
    Ok(out)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Policy
// ═══════════════════════════════════════════════════════════════════════════════

/// A fully validated policy as it travels through the log.
///
/// Carries the compiled tree so replicas never recompile during apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDraft {
    pub id: PolicyId,
    pub name: String,
    pub namespace: String,
    pub description: String,
    pub rules: String,
    pub compiled: RuleTree,
    pub datacenters: Vec<String>,
}

impl PolicyDraft {
    /// Content digest: identical drafts hash identically.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [&self.name, &self.namespace, &self.description] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(self.compiled.canonical_bytes());
        hasher.update([0u8]);
        for dc in &self.datacenters {
            hasher.update(dc.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }

    pub(crate) fn into_policy(self, raft_index: RaftIndex) -> Policy {
        let hash = self.content_hash();
        Policy {
            id: self.id,
            name: self.name,
            namespace: self.namespace,
            description: self.description,
            rules: self.rules,
            compiled: self.compiled,
            datacenters: self.datacenters,
            raft_index,
            hash,
        }
    }
}

/// A stored policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub id: PolicyId,
    pub name: String,
    pub namespace: String,
    pub description: String,
    /// Rule source text as submitted.
    pub rules: String,
    pub compiled: RuleTree,
    /// Datacenters the policy is valid in; empty means everywhere.
    pub datacenters: Vec<String>,
    pub raft_index: RaftIndex,
    pub hash: String,
}

impl Policy {
    /// Whether the policy contributes rules in `datacenter`.
    pub fn applies_in(&self, datacenter: &str) -> bool {
        self.datacenters.is_empty() || self.datacenters.iter().any(|dc| dc.eq_ignore_ascii_case(datacenter))
    }

    pub(crate) fn to_draft(&self) -> PolicyDraft {
        PolicyDraft {
            id: self.id,
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            description: self.description.clone(),
            rules: self.rules.clone(),
            compiled: self.compiled.clone(),
            datacenters: self.datacenters.clone(),
        }
    }
}

/// Input for creating a policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyCreate {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub rules: String,
    /// Explicit ID; generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub datacenters: Vec<String>,
    #[serde(default)]
    pub namespace: Option<String>,
}

impl PolicyCreate {
    pub fn new(name: impl Into<String>, rules: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rules: rules.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_datacenters<I, S>(mut self, datacenters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.datacenters = datacenters.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }
}

/// Partial update of a policy. Absent fields keep their current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub rules: Option<String>,
    #[serde(default)]
    pub datacenters: Option<Vec<String>>,
    /// Compare-and-swap guard on `raft_index.modify_index`.
    #[serde(default)]
    pub expected_index: Option<u64>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Token
// ═══════════════════════════════════════════════════════════════════════════════

/// A token as it travels through the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenDraft {
    pub accessor_id: AccessorId,
    pub secret_id: String,
    pub description: String,
    pub policies: Vec<PolicyId>,
    pub local: bool,
    pub datacenter: String,
    pub create_time: DateTime<Utc>,
    pub expiration_time: Option<DateTime<Utc>>,
}

impl TokenDraft {
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.description.as_bytes());
        hasher.update([0u8]);
        for id in &self.policies {
            hasher.update(id.0.as_bytes());
        }
        hasher.update([self.local as u8]);
        hasher.update(self.datacenter.as_bytes());
        if let Some(exp) = self.expiration_time {
            hasher.update(exp.timestamp_millis().to_be_bytes());
        }
        hex::encode(hasher.finalize())
    }

    pub(crate) fn into_token(self, raft_index: RaftIndex) -> Token {
        let hash = self.content_hash();
        Token {
            accessor_id: self.accessor_id,
            secret_id: self.secret_id,
            description: self.description,
            policies: self.policies,
            local: self.local,
            datacenter: self.datacenter,
            create_time: self.create_time,
            expiration_time: self.expiration_time,
            raft_index,
            hash,
        }
    }
}

/// A credential bound to one or more policies.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub accessor_id: AccessorId,
    pub secret_id: String,
    pub description: String,
    pub policies: Vec<PolicyId>,
    /// Local tokens are only honoured in their origin datacenter.
    pub local: bool,
    pub datacenter: String,
    pub create_time: DateTime<Utc>,
    pub expiration_time: Option<DateTime<Utc>>,
    pub raft_index: RaftIndex,
    pub hash: String,
}

impl Token {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration_time.is_some_and(|exp| exp <= now)
    }

    /// Whether the token may be used in `datacenter` at `now`.
    pub fn is_valid_in(&self, datacenter: &str, now: DateTime<Utc>) -> bool {
        !self.is_expired(now) && (!self.local || self.datacenter.eq_ignore_ascii_case(datacenter))
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("accessor_id", &self.accessor_id)
            .field("secret_id", &"<redacted>")
            .field("description", &self.description)
            .field("policies", &self.policies)
            .field("local", &self.local)
            .field("datacenter", &self.datacenter)
            .field("expiration_time", &self.expiration_time)
            .field("raft_index", &self.raft_index)
            .finish()
    }
}

/// Input for creating a token.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenCreate {
    #[serde(default)]
    pub description: String,
    pub policies: Vec<PolicyId>,
    #[serde(default)]
    pub local: bool,
    /// Explicit secret; generated when absent.
    #[serde(default)]
    pub secret_id: Option<String>,
    #[serde(default, with = "humantime_serde")]
    pub expiration_ttl: Option<std::time::Duration>,
}

impl TokenCreate {
    pub fn new(policies: Vec<PolicyId>) -> Self {
        Self {
            policies,
            ..Default::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn local(mut self) -> Self {
        self.local = true;
        self
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret_id = Some(secret.into());
        self
    }

    pub fn with_ttl(mut self, ttl: std::time::Duration) -> Self {
        self.expiration_ttl = Some(ttl);
        self
    }
}
