//! Rule language: parsing and compiled representation.
//!
//! - **Compiler**: turns rule text (block syntax or JSON) into a [`RuleTree`]
//! - **Model**: access levels, resource kinds, selectors and matching
//!
//! # Usage
//!
//! ```rust,ignore
//! use bastion_core::rules::{compile, ResourceKind, AccessLevel};
//!
//! let tree = compile(r#"service_prefix "" { policy = "write" }"#)?;
//! let levels: Vec<_> = tree.candidates(ResourceKind::Service, "web", None).collect();
//! ```

pub mod compiler;
pub mod model;

pub use compiler::compile;
pub use model::{
    AccessLevel, MatchKind, Qualifier, ResourceKind, Rule, RuleTree, Selector, Specificity,
};
