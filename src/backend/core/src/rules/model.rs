//! Compiled rule structures: access levels, resource kinds, selectors and the rule tree.

use serde::{Deserialize, Serialize};
use std::fmt;

// ═══════════════════════════════════════════════════════════════════════════════
// Access Level
// ═══════════════════════════════════════════════════════════════════════════════

/// Access level granted by a rule, ordered by increasing privilege.
///
/// `Deny < Read < Write < List`. A `Deny` grant never satisfies a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    Deny,
    Read,
    Write,
    List,
}

impl AccessLevel {
    /// Parse the textual form used in rule sources.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "deny" => Some(Self::Deny),
            "read" => Some(Self::Read),
            "write" => Some(Self::Write),
            "list" => Some(Self::List),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deny => "deny",
            Self::Read => "read",
            Self::Write => "write",
            Self::List => "list",
        }
    }

    pub fn is_deny(&self) -> bool {
        matches!(self, Self::Deny)
    }

    /// Whether holding `self` satisfies a request for `requested`.
    pub fn grants(&self, requested: AccessLevel) -> bool {
        !self.is_deny() && !requested.is_deny() && *self >= requested
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Resource Kind
// ═══════════════════════════════════════════════════════════════════════════════

/// The closed set of resource types rules can address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Acl,
    Agent,
    Event,
    Key,
    Keyring,
    Mesh,
    Node,
    Operator,
    Query,
    Service,
    Session,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 11] = [
        Self::Acl,
        Self::Agent,
        Self::Event,
        Self::Key,
        Self::Keyring,
        Self::Mesh,
        Self::Node,
        Self::Operator,
        Self::Query,
        Self::Service,
        Self::Session,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Acl => "acl",
            Self::Agent => "agent",
            Self::Event => "event",
            Self::Key => "key",
            Self::Keyring => "keyring",
            Self::Mesh => "mesh",
            Self::Node => "node",
            Self::Operator => "operator",
            Self::Query => "query",
            Self::Service => "service",
            Self::Session => "session",
        }
    }

    /// Kinds addressed as a whole (`operator = "read"`), without named segments.
    pub fn is_kind_level(&self) -> bool {
        matches!(self, Self::Acl | Self::Keyring | Self::Mesh | Self::Operator)
    }

    /// `list` is only meaningful for the key/value store.
    pub fn supports_list(&self) -> bool {
        matches!(self, Self::Key)
    }

    /// Only services carry an `intentions` sub-resource.
    pub fn supports_intentions(&self) -> bool {
        matches!(self, Self::Service)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Selector
// ═══════════════════════════════════════════════════════════════════════════════

/// How a selector's name is compared against a resource name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    Exact,
    Prefix,
}

/// How specifically a selector matched a resource.
///
/// Ordering is the precedence order: any exact match outranks every prefix
/// match, and longer prefixes outrank shorter ones. The empty prefix is the
/// least specific match possible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Specificity {
    Prefix(usize),
    Exact,
}

/// Resource selector of a rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Selector {
    pub kind: ResourceKind,
    pub name: String,
    #[serde(rename = "match")]
    pub match_kind: MatchKind,
}

impl Selector {
    pub fn exact(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            match_kind: MatchKind::Exact,
        }
    }

    pub fn prefix(kind: ResourceKind, prefix: impl Into<String>) -> Self {
        Self {
            kind,
            name: prefix.into(),
            match_kind: MatchKind::Prefix,
        }
    }

    /// Selector for a kind-level rule such as `operator = "read"`.
    pub fn kind_level(kind: ResourceKind) -> Self {
        Self::exact(kind, "")
    }

    /// Match against a resource, returning the specificity on success.
    ///
    /// Kind-level selectors match every request for their kind; the
    /// resource name is irrelevant there.
    pub fn matches(&self, kind: ResourceKind, name: &str) -> Option<Specificity> {
        if self.kind != kind {
            return None;
        }
        if kind.is_kind_level() {
            return Some(Specificity::Exact);
        }
        match self.match_kind {
            MatchKind::Exact if self.name == name => Some(Specificity::Exact),
            MatchKind::Prefix if name.starts_with(&self.name) => {
                Some(Specificity::Prefix(self.name.len()))
            }
            _ => None,
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.match_kind, self.kind.is_kind_level()) {
            (MatchKind::Exact, true) => write!(f, "{}", self.kind),
            (MatchKind::Exact, false) => write!(f, "{} {:?}", self.kind, self.name),
            (MatchKind::Prefix, _) => write!(f, "{}_prefix {:?}", self.kind, self.name),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Rule + Rule Tree
// ═══════════════════════════════════════════════════════════════════════════════

/// A single compiled rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rule {
    pub selector: Selector,

    /// Access to the resource itself.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<AccessLevel>,

    /// Access to the service's intentions sub-resource.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intentions: Option<AccessLevel>,
}

/// Sub-resource qualifier on a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Qualifier {
    Intentions,
}

impl Rule {
    /// The level this rule contributes for a request, if any.
    ///
    /// Intentions requests use the explicit `intentions` grant when present;
    /// otherwise the resource grant is used, capped at `read`.
    pub fn level_for(&self, qualifier: Option<Qualifier>) -> Option<AccessLevel> {
        match qualifier {
            None => self.policy,
            Some(Qualifier::Intentions) => self
                .intentions
                .or_else(|| self.policy.map(|p| p.min(AccessLevel::Read))),
        }
    }
}

/// A compiled, canonically ordered set of rules.
///
/// Rules are sorted by selector so that equivalent sources produce
/// structurally identical trees.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleTree {
    rules: Vec<Rule>,
}

impl RuleTree {
    /// Build from rules already validated and deduplicated by selector.
    pub(crate) fn from_sorted(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Iterate over `(specificity, level)` for every rule matching the request.
    pub fn candidates<'a>(
        &'a self,
        kind: ResourceKind,
        name: &'a str,
        qualifier: Option<Qualifier>,
    ) -> impl Iterator<Item = (Specificity, AccessLevel)> + 'a {
        self.rules.iter().filter_map(move |rule| {
            let specificity = rule.selector.matches(kind, name)?;
            let level = rule.level_for(qualifier)?;
            Some((specificity, level))
        })
    }

    /// Canonical byte form used for content hashing.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&self.rules).unwrap_or_default()
    }
}
