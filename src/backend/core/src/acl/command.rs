//! Commands replicated through the log and the results of applying them.

use serde::{Deserialize, Serialize};

use super::models::{AccessorId, Policy, PolicyDraft, PolicyId, Token, TokenDraft};
use crate::error::AclError;

/// A state-machine mutation. Every replica applies the same sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    CreatePolicy {
        policy: PolicyDraft,
    },
    UpdatePolicy {
        policy: PolicyDraft,
        expected_index: Option<u64>,
    },
    DeletePolicy {
        id: PolicyId,
    },
    CreateToken {
        token: TokenDraft,
    },
    DeleteToken {
        accessor_id: AccessorId,
    },
    /// Install the management policy and the first management token.
    Bootstrap {
        policy: PolicyDraft,
        token: TokenDraft,
    },
}

impl Command {
    /// Short operation name used in logs and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreatePolicy { .. } => "create_policy",
            Self::UpdatePolicy { .. } => "update_policy",
            Self::DeletePolicy { .. } => "delete_policy",
            Self::CreateToken { .. } => "create_token",
            Self::DeleteToken { .. } => "delete_token",
            Self::Bootstrap { .. } => "bootstrap",
        }
    }
}

/// The observable effect of an applied command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Policy(Policy),
    PolicyDeleted { id: PolicyId, existed: bool },
    Token(Token),
    TokenDeleted { accessor_id: AccessorId, existed: bool },
    Bootstrapped { policy: Policy, token: Token },
}

impl Applied {
    pub fn into_policy(self) -> crate::error::Result<Policy> {
        match self {
            Self::Policy(p) => Ok(p),
            other => Err(unexpected("policy", &other)),
        }
    }

    pub fn into_token(self) -> crate::error::Result<Token> {
        match self {
            Self::Token(t) => Ok(t),
            other => Err(unexpected("token", &other)),
        }
    }
}

fn unexpected(wanted: &str, got: &Applied) -> AclError {
    AclError::internal(format!("expected {} result, state machine returned {:?}", wanted, got))
}

/// Outcome of applying one entry. Deterministic rejections (`Conflict`,
/// `NotFound`) are outcomes too: the entry is still consumed.
pub type ApplyOutcome = crate::error::Result<Applied>;
