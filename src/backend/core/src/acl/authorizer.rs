//! Authorization engine.
//!
//! Answers "may the holder of this secret perform `access` on this
//! resource?" against the local replica. Evaluation never waits on
//! consensus; it sees whatever the replica has applied.
//!
//! # Tie-break
//!
//! | Step | Rule                                                          |
//! |------|---------------------------------------------------------------|
//! | 1    | Highest specificity wins: exact, then longer prefix           |
//! | 2    | Among equally specific matches, any `deny` wins               |
//! | 3    | Otherwise the highest allow level among them applies          |
//! | 4    | Nothing matches: deny                                         |
//!
//! Namespace and token locality only decide which policies are
//! applicable. They never change the ranking.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::counter;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument, trace};

use super::models::AccessorId;
use super::state::PolicyState;
use crate::consensus::LogIndex;
use crate::error::{AclError, Result};
use crate::rules::{AccessLevel, Qualifier, ResourceKind, RuleTree, Specificity};

// ═══════════════════════════════════════════════════════════════════════════════
// Request + Decision
// ═══════════════════════════════════════════════════════════════════════════════

/// The resource a request targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub kind: ResourceKind,
    pub name: String,
    pub qualifier: Option<Qualifier>,
}

impl Resource {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            qualifier: None,
        }
    }

    /// A kind-level resource such as `acl` or `operator`.
    pub fn kind_level(kind: ResourceKind) -> Self {
        Self::new(kind, "")
    }

    /// The intentions sub-resource of a service.
    pub fn intentions(service: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Service,
            name: service.into(),
            qualifier: Some(Qualifier::Intentions),
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.qualifier, self.kind.is_kind_level()) {
            (Some(Qualifier::Intentions), _) => write!(f, "{}:{}:intentions", self.kind, self.name),
            (None, true) => write!(f, "{}", self.kind),
            (None, false) => write!(f, "{}:{}", self.kind, self.name),
        }
    }
}

/// Result of an authorization check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Evaluation
// ═══════════════════════════════════════════════════════════════════════════════

/// The winning specificity tier while scanning candidates.
struct Tier {
    specificity: Specificity,
    deny: bool,
    allow: Option<AccessLevel>,
}

/// Effective level for a resource across a set of rule trees.
///
/// `None` when no rule matches; `Some(Deny)` when the winning tier denies.
pub fn effective_level<'a, I>(trees: I, resource: &Resource) -> Option<AccessLevel>
where
    I: IntoIterator<Item = &'a RuleTree>,
{
    let mut best: Option<Tier> = None;

    for tree in trees {
        for (specificity, level) in tree.candidates(resource.kind, &resource.name, resource.qualifier) {
            match best.as_mut() {
                Some(tier) if specificity == tier.specificity => {
                    if level.is_deny() {
                        tier.deny = true;
                    } else {
                        tier.allow = tier.allow.max(Some(level));
                    }
                }
                Some(tier) if specificity < tier.specificity => {}
                _ => {
                    best = Some(Tier {
                        specificity,
                        deny: level.is_deny(),
                        allow: (!level.is_deny()).then_some(level),
                    });
                }
            }
        }
    }

    best.map(|tier| if tier.deny { AccessLevel::Deny } else { tier.allow.unwrap_or(AccessLevel::Deny) })
}

/// Decide a request against a set of rule trees.
pub fn evaluate<'a, I>(trees: I, resource: &Resource, access: AccessLevel) -> Decision
where
    I: IntoIterator<Item = &'a RuleTree>,
{
    match effective_level(trees, resource) {
        Some(level) if level.grants(access) => Decision::Allow,
        _ => Decision::Deny,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Authorizer
// ═══════════════════════════════════════════════════════════════════════════════

/// A token resolved to the rules it carries in this datacenter.
#[derive(Debug)]
pub struct ResolvedIdentity {
    pub accessor_id: AccessorId,
    pub local: bool,
    pub datacenter: String,
    pub expiration_time: Option<DateTime<Utc>>,
    pub trees: Vec<RuleTree>,
    /// Applied index the resolution was computed at.
    pub index: LogIndex,
}

impl ResolvedIdentity {
    fn is_valid_in(&self, datacenter: &str, now: DateTime<Utc>) -> bool {
        let expired = self.expiration_time.is_some_and(|exp| exp <= now);
        !expired && (!self.local || self.datacenter.eq_ignore_ascii_case(datacenter))
    }
}

/// Authorization engine over one replica's state.
///
/// Thread-safe; the resolution cache is a `DashMap` keyed by secret and
/// stamped with the applied index.
pub struct Authorizer {
    state: Arc<RwLock<PolicyState>>,
    datacenter: String,
    cache: DashMap<String, Arc<ResolvedIdentity>>,
    cache_capacity: usize,
}

impl Authorizer {
    pub fn new(state: Arc<RwLock<PolicyState>>, datacenter: impl Into<String>, cache_capacity: usize) -> Self {
        Self {
            state,
            datacenter: datacenter.into(),
            cache: DashMap::new(),
            cache_capacity,
        }
    }

    pub fn datacenter(&self) -> &str {
        &self.datacenter
    }

    /// Resolve a secret to its applicable rules.
    ///
    /// Fails with `InvalidToken` for unknown, expired, or foreign local tokens.
    pub fn resolve(&self, secret: &str) -> Result<Arc<ResolvedIdentity>> {
        let now = Utc::now();
        let state = self.state.read();
        let index = state.applied_index();

        let identity = match self.cache.get(secret).map(|c| c.value().clone()) {
            Some(cached) if cached.index == index => {
                trace!(index, "Authorizer cache hit");
                cached
            }
            _ => {
                let token = state.token_by_secret(secret).ok_or_else(AclError::invalid_token)?;
                let trees = token
                    .policies
                    .iter()
                    .filter_map(|id| state.policy(id))
                    .filter(|p| p.applies_in(&self.datacenter))
                    .map(|p| p.compiled.clone())
                    .collect();
                let resolved = Arc::new(ResolvedIdentity {
                    accessor_id: token.accessor_id,
                    local: token.local,
                    datacenter: token.datacenter.clone(),
                    expiration_time: token.expiration_time,
                    trees,
                    index,
                });
                drop(state);

                if self.cache.len() >= self.cache_capacity {
                    debug!(entries = self.cache.len(), "Authorizer cache full, clearing");
                    self.cache.clear();
                }
                self.cache.insert(secret.to_string(), Arc::clone(&resolved));
                resolved
            }
        };

        if !identity.is_valid_in(&self.datacenter, now) {
            return Err(AclError::invalid_token());
        }
        Ok(identity)
    }

    /// Decide a request.
    #[instrument(skip(self, secret), fields(resource = %resource, access = %access))]
    pub fn authorize(&self, secret: &str, resource: &Resource, access: AccessLevel) -> Result<Decision> {
        let identity = self.resolve(secret)?;
        let decision = evaluate(&identity.trees, resource, access);

        counter!(
            "bastion_authorize_total",
            "kind" => resource.kind.as_str(),
            "decision" => decision.as_str(),
        )
        .increment(1);
        debug!(accessor = %identity.accessor_id, decision = decision.as_str(), "Authorization decided");
        Ok(decision)
    }

    /// Decide a request, treating every failure as `Deny`.
    pub fn authorize_or_deny(&self, secret: &str, resource: &Resource, access: AccessLevel) -> Decision {
        match self.authorize(secret, resource, access) {
            Ok(decision) => decision,
            Err(e) => {
                e.log();
                counter!(
                    "bastion_authorize_total",
                    "kind" => resource.kind.as_str(),
                    "decision" => "error",
                )
                .increment(1);
                Decision::Deny
            }
        }
    }

    /// Require `access` on `resource`, failing with `PermissionDenied`.
    pub fn require(&self, secret: &str, resource: &Resource, access: AccessLevel) -> Result<()> {
        match self.authorize(secret, resource, access)? {
            Decision::Allow => Ok(()),
            Decision::Deny => {
                let err = AclError::permission_denied(format!("{}:{}", resource, access));
                err.log();
                Err(err)
            }
        }
    }

    /// Drop every cached resolution.
    pub fn invalidate(&self) {
        self.cache.clear();
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }
}

impl fmt::Debug for Authorizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authorizer")
            .field("datacenter", &self.datacenter)
            .field("cached", &self.cache.len())
            .finish()
    }
}
