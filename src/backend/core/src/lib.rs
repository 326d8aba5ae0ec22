#![allow(clippy::result_large_err)]
//! # Bastion Core
//!
//! Replicated ACL policy store and authorization engine for a service-mesh
//! control plane.
//!
//! ## Architecture
//!
//! - **Rules**: compiles HCL/JSON rule documents into ordered rule trees
//! - **ACL**: policies, tokens, the replicated state machine and the authorizer
//! - **Consensus**: the replicated log, leader routing and the write path
//! - **Consistency**: stale, default and strong read barriers
//! - **Node**: wiring of one cluster member, and an in-process cluster
//! - **Telemetry**: structured logging with secret redaction, Prometheus metrics

pub mod acl;
pub mod config;
pub mod consensus;
pub mod consistency;
pub mod error;
pub mod node;
pub mod rules;
pub mod telemetry;

pub use error::{AclError, ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::acl::{
        AccessorId, AuthContext, Authorizer, Decision, Policy, PolicyCreate, PolicyId, PolicyStore,
        PolicyUpdate, Resource, Token, TokenCreate, GLOBAL_MANAGEMENT_ID,
    };
    pub use crate::consistency::{Consistency, QueryMeta};
    pub use crate::error::{AclError, ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, Result};
    pub use crate::node::{LocalCluster, Node, NodeOptions};
    pub use crate::rules::{compile, AccessLevel, ResourceKind, RuleTree};
}
