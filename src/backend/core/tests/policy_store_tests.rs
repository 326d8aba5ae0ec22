//! Integration tests for the Policy Store.
//!
//! Tests cover:
//! - The svc-write create / duplicate-ID / strong-read scenario
//! - ID and name uniqueness, tombstones
//! - Monotonic versioning and compare-and-swap updates
//! - Idempotent deletes
//! - Privilege enforcement and the management policy
//! - Token lifecycle and bootstrap

use bastion_core::acl::{
    AccessorId, AuthContext, PolicyCreate, PolicyId, PolicyUpdate, TokenCreate,
    GLOBAL_MANAGEMENT_ID, GLOBAL_MANAGEMENT_NAME, HIDDEN_SECRET,
};
use bastion_core::consistency::Consistency;
use bastion_core::error::ErrorCode;
use bastion_core::node::{LocalCluster, NodeOptions};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const ROOT: &str = "root-secret";

async fn bootstrapped_cluster() -> LocalCluster {
    let options = NodeOptions {
        apply_timeout: Duration::from_millis(500),
        ..Default::default()
    };
    let cluster = LocalCluster::in_memory(["a", "b", "c"], &options).unwrap();
    cluster.raft().elect("a").unwrap();
    cluster
        .node("a")
        .unwrap()
        .store()
        .bootstrap(Some(ROOT.to_string()), &CancellationToken::new())
        .await
        .unwrap();
    cluster
}

fn root() -> AuthContext {
    AuthContext::new(ROOT)
}

// ============================================================================
// Create / Read Scenario
// ============================================================================

#[tokio::test]
async fn test_svc_write_scenario() {
    let cluster = bootstrapped_cluster().await;
    let store = cluster.node("a").unwrap().store();
    let rules = r#"service "" { policy = "write" }"#;

    let first = store
        .create(&root(), PolicyCreate::new("svc-write", rules))
        .await
        .unwrap();
    assert!(!first.id.to_string().is_empty());
    assert_ne!(first.id, GLOBAL_MANAGEMENT_ID);

    let duplicate = store
        .create(
            &root(),
            PolicyCreate::new("svc-write-2", rules).with_id(first.id.to_string()),
        )
        .await
        .unwrap_err();
    assert_eq!(duplicate.code(), ErrorCode::Conflict);

    let (read, meta) = store.read(&root(), &first.id, Consistency::Strong).await.unwrap();
    assert_eq!(read, first);
    assert_eq!(meta.consistency, Consistency::Strong);
    assert!(meta.known_leader);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_round_trip_structural_equality() {
    let cluster = bootstrapped_cluster().await;
    let store = cluster.node("a").unwrap().store();

    let created = store
        .create(
            &root(),
            PolicyCreate::new(
                "web",
                "# web tier\nservice \"web\" { policy = \"write\" }\nnode_prefix \"\" { policy = \"read\" }",
            )
            .with_description("web tier")
            .with_datacenters(["DC1", "dc2"]),
        )
        .await
        .unwrap();

    let (read, _) = store.read(&root(), &created.id, Consistency::Strong).await.unwrap();
    assert_eq!(read.name, "web");
    assert_eq!(read.rules, created.rules);
    assert_eq!(read.datacenters, vec!["dc1".to_string(), "dc2".to_string()]);
    assert_eq!(read.compiled, bastion_core::rules::compile(&created.rules).unwrap());
    assert_eq!(read.hash, created.hash);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_create_rejects_bad_input_before_submission() {
    let cluster = bootstrapped_cluster().await;
    let store = cluster.node("a").unwrap().store();
    let before = cluster.raft().current();
    let applied = cluster.node("a").unwrap().replica().applied_index();

    let syntax = store
        .create(&root(), PolicyCreate::new("bad", r#"service "web" { policy = "write" "#))
        .await
        .unwrap_err();
    assert_eq!(syntax.code(), ErrorCode::RuleSyntax);

    let semantic = store
        .create(&root(), PolicyCreate::new("bad", r#"widget "x" { policy = "read" }"#))
        .await
        .unwrap_err();
    assert_eq!(semantic.code(), ErrorCode::RuleSemantic);

    let bad_id = store
        .create(&root(), PolicyCreate::new("bad", "").with_id("not-a-uuid"))
        .await
        .unwrap_err();
    assert_eq!(bad_id.code(), ErrorCode::InvalidInput);

    let bad_name = store
        .create(&root(), PolicyCreate::new("has space", ""))
        .await
        .unwrap_err();
    assert_eq!(bad_name.code(), ErrorCode::InvalidInput);

    // Nothing reached the log.
    assert_eq!(cluster.node("a").unwrap().replica().applied_index(), applied);
    assert_eq!(cluster.raft().current(), before);

    cluster.shutdown().await;
}

// ============================================================================
// Uniqueness
// ============================================================================

#[tokio::test]
async fn test_name_unique_per_namespace() {
    let cluster = bootstrapped_cluster().await;
    let store = cluster.node("a").unwrap().store();

    let a = store.create(&root(), PolicyCreate::new("ops", "")).await.unwrap();
    let err = store.create(&root(), PolicyCreate::new("ops", "")).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::Conflict);

    // Case-sensitive, and scoped to the namespace.
    let b = store.create(&root(), PolicyCreate::new("Ops", "")).await.unwrap();
    let c = store
        .create(&root(), PolicyCreate::new("ops", "").with_namespace("team-a"))
        .await
        .unwrap();
    assert_ne!(a.id, b.id);
    assert_ne!(a.id, c.id);

    let (by_name, _) = store
        .read_by_name(&root(), Some("team-a"), "ops", Consistency::Default)
        .await
        .unwrap();
    assert_eq!(by_name.id, c.id);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_deleted_id_never_reused() {
    let cluster = bootstrapped_cluster().await;
    let store = cluster.node("a").unwrap().store();
    let id = PolicyId::new();

    store
        .create(&root(), PolicyCreate::new("temp", "").with_id(id.to_string()))
        .await
        .unwrap();
    assert!(store.delete(&root(), &id).await.unwrap());

    let err = store
        .create(&root(), PolicyCreate::new("temp", "").with_id(id.to_string()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Conflict);

    // The name was freed.
    let fresh = store.create(&root(), PolicyCreate::new("temp", "")).await.unwrap();
    assert_ne!(fresh.id, id);

    let err = store.read(&root(), &id, Consistency::Default).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);

    cluster.shutdown().await;
}

// ============================================================================
// Versioning
// ============================================================================

#[tokio::test]
async fn test_modify_index_strictly_increases() {
    let cluster = bootstrapped_cluster().await;
    let store = cluster.node("a").unwrap().store();

    let v1 = store.create(&root(), PolicyCreate::new("versioned", "")).await.unwrap();
    let v2 = store
        .update(
            &root(),
            &v1.id,
            PolicyUpdate {
                description: Some("second".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let v3 = store
        .update(
            &root(),
            &v1.id,
            PolicyUpdate {
                rules: Some(r#"key_prefix "app/" { policy = "read" }"#.into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert!(v1.raft_index.modify_index < v2.raft_index.modify_index);
    assert!(v2.raft_index.modify_index < v3.raft_index.modify_index);
    assert_eq!(v3.raft_index.create_index, v1.raft_index.create_index);
    assert_ne!(v2.hash, v3.hash);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_update_compare_and_swap() {
    let cluster = bootstrapped_cluster().await;
    let store = cluster.node("a").unwrap().store();

    let v1 = store.create(&root(), PolicyCreate::new("cas", "")).await.unwrap();
    let v2 = store
        .update(
            &root(),
            &v1.id,
            PolicyUpdate {
                description: Some("won".into()),
                expected_index: Some(v1.raft_index.modify_index),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let err = store
        .update(
            &root(),
            &v1.id,
            PolicyUpdate {
                description: Some("lost".into()),
                expected_index: Some(v1.raft_index.modify_index),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Conflict);

    let (current, _) = store.read(&root(), &v1.id, Consistency::Strong).await.unwrap();
    assert_eq!(current.description, "won");
    assert_eq!(current.raft_index, v2.raft_index);

    let missing = store
        .update(&root(), &PolicyId::new(), PolicyUpdate::default())
        .await
        .unwrap_err();
    assert_eq!(missing.code(), ErrorCode::NotFound);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_rename_into_taken_name_conflicts() {
    let cluster = bootstrapped_cluster().await;
    let store = cluster.node("a").unwrap().store();

    store.create(&root(), PolicyCreate::new("left", "")).await.unwrap();
    let right = store.create(&root(), PolicyCreate::new("right", "")).await.unwrap();

    let err = store
        .update(
            &root(),
            &right.id,
            PolicyUpdate {
                name: Some("left".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Conflict);

    cluster.shutdown().await;
}

// ============================================================================
// Delete
// ============================================================================

#[tokio::test]
async fn test_delete_is_idempotent() {
    let cluster = bootstrapped_cluster().await;
    let store = cluster.node("a").unwrap().store();

    let missing = PolicyId::new();
    assert!(!store.delete(&root(), &missing).await.unwrap());
    assert!(!store.delete(&root(), &missing).await.unwrap());

    let policy = store.create(&root(), PolicyCreate::new("gone", "")).await.unwrap();
    assert!(store.delete(&root(), &policy.id).await.unwrap());
    assert!(!store.delete(&root(), &policy.id).await.unwrap());

    let (all, _) = store.list(&root(), Consistency::Default).await.unwrap();
    assert!(all.iter().all(|p| p.id != policy.id));

    cluster.shutdown().await;
}

// ============================================================================
// Privileges
// ============================================================================

#[tokio::test]
async fn test_privilege_checked_before_lookup() {
    let cluster = bootstrapped_cluster().await;
    let store = cluster.node("a").unwrap().store();

    let reader_policy = store
        .create(&root(), PolicyCreate::new("acl-read", r#"acl = "read""#))
        .await
        .unwrap();
    let nobody_policy = store
        .create(&root(), PolicyCreate::new("nothing", r#"service "web" { policy = "read" }"#))
        .await
        .unwrap();
    let reader = store
        .create_token(&root(), TokenCreate::new(vec![reader_policy.id]).with_secret("reader"))
        .await
        .unwrap();
    store
        .create_token(&root(), TokenCreate::new(vec![nobody_policy.id]).with_secret("nobody"))
        .await
        .unwrap();

    let reader_auth = AuthContext::new("reader");
    let nobody_auth = AuthContext::new("nobody");

    // Readers read, but cannot write.
    store.read(&reader_auth, &reader_policy.id, Consistency::Stale).await.unwrap();
    let err = store
        .create(&reader_auth, PolicyCreate::new("sneaky", ""))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::PermissionDenied);

    // Denial looks the same whether or not the target exists.
    let existing = store
        .read(&nobody_auth, &reader_policy.id, Consistency::Stale)
        .await
        .unwrap_err();
    let missing = store
        .read(&nobody_auth, &PolicyId::new(), Consistency::Stale)
        .await
        .unwrap_err();
    assert_eq!(existing.code(), ErrorCode::PermissionDenied);
    assert_eq!(missing.code(), ErrorCode::PermissionDenied);
    assert_eq!(existing.message(), missing.message());

    let unknown = store
        .delete(&AuthContext::new("who-knows"), &reader_policy.id)
        .await
        .unwrap_err();
    assert_eq!(unknown.code(), ErrorCode::InvalidToken);

    // The secret is only visible to acl:write holders.
    let (seen, _) = store
        .read_token(&reader_auth, &reader.accessor_id, Consistency::Stale)
        .await
        .unwrap();
    assert_eq!(seen.secret_id, HIDDEN_SECRET);
    let (seen, _) = store
        .read_token(&root(), &reader.accessor_id, Consistency::Stale)
        .await
        .unwrap();
    assert_eq!(seen.secret_id, "reader");

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_management_policy_protected() {
    let cluster = bootstrapped_cluster().await;
    let store = cluster.node("a").unwrap().store();

    let (management, _) = store
        .read(&root(), &GLOBAL_MANAGEMENT_ID, Consistency::Strong)
        .await
        .unwrap();
    assert_eq!(management.name, GLOBAL_MANAGEMENT_NAME);

    let err = store.delete(&root(), &GLOBAL_MANAGEMENT_ID).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidInput);

    let err = store
        .update(
            &root(),
            &GLOBAL_MANAGEMENT_ID,
            PolicyUpdate {
                name: Some("renamed".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidInput);

    // Descriptions may still change.
    store
        .update(
            &root(),
            &GLOBAL_MANAGEMENT_ID,
            PolicyUpdate {
                description: Some("root access".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    cluster.shutdown().await;
}

// ============================================================================
// Tokens and Bootstrap
// ============================================================================

#[tokio::test]
async fn test_bootstrap_only_once() {
    let cluster = bootstrapped_cluster().await;
    let store = cluster.node("b").unwrap().store();

    let err = store
        .bootstrap(Some("again".into()), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Conflict);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_bootstrap_generates_secret() {
    let cluster = LocalCluster::in_memory(["solo"], &NodeOptions::default()).unwrap();
    cluster.raft().elect("solo").unwrap();
    let store = cluster.node("solo").unwrap().store();

    let token = store.bootstrap(None, &CancellationToken::new()).await.unwrap();
    assert_eq!(token.policies, vec![GLOBAL_MANAGEMENT_ID]);
    assert!(!token.local);

    let (policies, _) = store
        .list(&AuthContext::new(token.secret_id.clone()), Consistency::Default)
        .await
        .unwrap();
    assert_eq!(policies.len(), 1);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_token_lifecycle() {
    let cluster = bootstrapped_cluster().await;
    let store = cluster.node("a").unwrap().store();

    let err = store
        .create_token(&root(), TokenCreate::new(vec![PolicyId::new()]))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);

    let dup_secret = store
        .create_token(&root(), TokenCreate::new(vec![]).with_secret(ROOT))
        .await
        .unwrap_err();
    assert_eq!(dup_secret.code(), ErrorCode::Conflict);

    let token = store
        .create_token(
            &root(),
            TokenCreate::new(vec![GLOBAL_MANAGEMENT_ID, GLOBAL_MANAGEMENT_ID]).with_description("ci"),
        )
        .await
        .unwrap();
    assert_eq!(token.policies, vec![GLOBAL_MANAGEMENT_ID]);
    assert_eq!(token.datacenter, "dc1");

    assert!(store.delete_token(&root(), &token.accessor_id).await.unwrap());
    assert!(!store.delete_token(&root(), &token.accessor_id).await.unwrap());
    assert!(!store.delete_token(&root(), &AccessorId::new()).await.unwrap());

    let err = store
        .read_token(&root(), &token.accessor_id, Consistency::Default)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);

    cluster.shutdown().await;
}
