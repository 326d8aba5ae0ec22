//! ACL policies, tokens and authorization.
//!
//! This module provides:
//! - **Models**: Policy, Token and their write inputs
//! - **State**: the replicated state machine the log is folded into
//! - **Replica**: the per-node apply loop
//! - **Authorizer**: token resolution and Allow/Deny decisions
//! - **Management**: the built-in global-management policy and bootstrap
//! - **Store**: the client-facing operations with privilege checks
//!
//! # Usage
//!
//! ```rust,ignore
//! use bastion_core::acl::{AuthContext, PolicyCreate};
//! use bastion_core::consistency::Consistency;
//!
//! let auth = AuthContext::new("root");
//! let policy = store
//!     .create(&auth, PolicyCreate::new("svc-write", r#"service "" { policy = "write" }"#))
//!     .await?;
//! let (read, meta) = store.read(&auth, &policy.id, Consistency::Strong).await?;
//! ```

pub mod authorizer;
pub mod command;
pub mod management;
pub mod models;
pub mod replica;
pub mod state;
pub mod store;

pub use authorizer::{effective_level, evaluate, Authorizer, Decision, ResolvedIdentity, Resource};
pub use command::{Applied, ApplyOutcome, Command};
pub use management::{GLOBAL_MANAGEMENT_ID, GLOBAL_MANAGEMENT_NAME};
pub use models::{
    AccessorId, Policy, PolicyCreate, PolicyDraft, PolicyId, PolicyUpdate, RaftIndex, Token,
    TokenCreate, TokenDraft, DEFAULT_NAMESPACE,
};
pub use replica::Replica;
pub use state::PolicyState;
pub use store::{AuthContext, PolicyStore, HIDDEN_SECRET};
