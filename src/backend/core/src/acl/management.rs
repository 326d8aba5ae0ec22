//! The built-in global-management policy and one-time bootstrap.
//!
//! | Item                | Value                                   |
//! |---------------------|-----------------------------------------|
//! | Policy ID           | `00000000-0000-0000-0000-000000000001`  |
//! | Policy name         | `global-management`                     |
//! | Grants              | every resource kind, highest level      |
//!
//! The policy cannot be deleted or renamed. Bootstrap installs it together
//! with the first management token and succeeds at most once per cluster.

use chrono::Utc;
use uuid::Uuid;

use super::command::Command;
use super::models::{AccessorId, PolicyDraft, PolicyId, TokenDraft, DEFAULT_NAMESPACE};
use crate::error::Result;
use crate::rules::compile;

/// Fixed ID of the global-management policy.
pub const GLOBAL_MANAGEMENT_ID: PolicyId = PolicyId(Uuid::from_u128(1));

pub const GLOBAL_MANAGEMENT_NAME: &str = "global-management";

/// Rules granting full access to everything.
pub const GLOBAL_MANAGEMENT_RULES: &str = r#"
acl = "write"
keyring = "write"
mesh = "write"
operator = "write"

agent_prefix "" { policy = "write" }
event_prefix "" { policy = "write" }
key_prefix "" { policy = "list" }
node_prefix "" { policy = "write" }
query_prefix "" { policy = "write" }
service_prefix "" { policy = "write" intentions = "write" }
session_prefix "" { policy = "write" }
"#;

/// Draft of the global-management policy.
pub fn global_management_policy() -> Result<PolicyDraft> {
    Ok(PolicyDraft {
        id: GLOBAL_MANAGEMENT_ID,
        name: GLOBAL_MANAGEMENT_NAME.to_string(),
        namespace: DEFAULT_NAMESPACE.to_string(),
        description: "Builtin Policy that grants unlimited access".to_string(),
        rules: GLOBAL_MANAGEMENT_RULES.to_string(),
        compiled: compile(GLOBAL_MANAGEMENT_RULES)?,
        datacenters: Vec::new(),
    })
}

/// Build the bootstrap command. A secret is generated when none is given.
pub fn bootstrap_command(secret: Option<String>, datacenter: &str) -> Result<Command> {
    let token = TokenDraft {
        accessor_id: AccessorId::new(),
        secret_id: secret.unwrap_or_else(|| Uuid::new_v4().to_string()),
        description: "Bootstrap Token (Global Management)".to_string(),
        policies: vec![GLOBAL_MANAGEMENT_ID],
        local: false,
        datacenter: datacenter.to_string(),
        create_time: Utc::now(),
        expiration_time: None,
    };
    Ok(Command::Bootstrap {
        policy: global_management_policy()?,
        token,
    })
}
