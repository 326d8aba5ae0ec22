//! Integration tests for the consensus write path.
//!
//! Tests cover:
//! - Transparent forwarding from followers to the leader
//! - NoLeader and NotLeaderAnymore
//! - Timeouts that still commit once quorum returns
//! - Caller cancellation
//! - Replay of a durable log into identical state

use bastion_core::acl::{AuthContext, Command, PolicyCreate, PolicyId, PolicyUpdate, TokenCreate};
use bastion_core::consensus::{FileStorage, LogStorage};
use bastion_core::consistency::Consistency;
use bastion_core::error::ErrorCode;
use bastion_core::node::{LocalCluster, NodeOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const ROOT: &str = "root-secret";

fn options() -> NodeOptions {
    NodeOptions {
        apply_timeout: Duration::from_millis(200),
        ..Default::default()
    }
}

async fn bootstrapped_cluster() -> LocalCluster {
    let cluster = LocalCluster::in_memory(["a", "b", "c"], &options()).unwrap();
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
// Forwarding
// ============================================================================

#[tokio::test]
async fn test_follower_forwards_to_leader() {
    let cluster = bootstrapped_cluster().await;
    let follower = cluster.node("c").unwrap();

    // The follower needs the bootstrap token locally to pass the privilege check.
    follower
        .store()
        .list(&root(), Consistency::Default)
        .await
        .unwrap();

    let created = follower
        .store()
        .create(&root(), PolicyCreate::new("from-follower", ""))
        .await
        .unwrap();

    // Read-your-writes on the follower, without a barrier.
    let (local, _) = follower
        .store()
        .read(&root(), &created.id, Consistency::Stale)
        .await
        .unwrap();
    assert_eq!(local, created);

    let (on_leader, _) = cluster
        .node("a")
        .unwrap()
        .store()
        .read(&root(), &created.id, Consistency::Stale)
        .await
        .unwrap();
    assert_eq!(on_leader, created);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_follower_updates_policy_just_created_on_leader() {
    let cluster = bootstrapped_cluster().await;
    let follower = cluster.node("c").unwrap();
    follower
        .store()
        .list(&root(), Consistency::Default)
        .await
        .unwrap();

    for round in 0..5 {
        let created = cluster
            .node("a")
            .unwrap()
            .store()
            .create(&root(), PolicyCreate::new(format!("fresh-{}", round), ""))
            .await
            .unwrap();

        // No expected index: merged onto the leader's latest version.
        let updated = follower
            .store()
            .update(
                &root(),
                &created.id,
                PolicyUpdate {
                    description: Some("from follower".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, created.name);
        assert_eq!(updated.description, "from follower");
        assert!(updated.raft_index.modify_index > created.raft_index.modify_index);
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_writes_survive_leader_change() {
    let cluster = bootstrapped_cluster().await;
    let before = cluster
        .node("a")
        .unwrap()
        .store()
        .create(&root(), PolicyCreate::new("durable", ""))
        .await
        .unwrap();

    cluster.raft().elect("b").unwrap();
    let b = cluster.node("b").unwrap();
    let (read, meta) = b.store().read(&root(), &before.id, Consistency::Strong).await.unwrap();
    assert_eq!(read, before);
    assert!(meta.index >= before.raft_index.modify_index);

    // The new leader accepts writes.
    let updated = b
        .store()
        .update(
            &root(),
            &before.id,
            PolicyUpdate {
                description: Some("after failover".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(updated.raft_index.modify_index > before.raft_index.modify_index);

    cluster.shutdown().await;
}

// ============================================================================
// Leadership Errors
// ============================================================================

#[tokio::test]
async fn test_no_leader() {
    let cluster = bootstrapped_cluster().await;
    cluster.raft().step_down();

    let err = cluster
        .node("a")
        .unwrap()
        .store()
        .create(&root(), PolicyCreate::new("orphan", ""))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NoLeader);
    assert!(err.is_retryable());

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_stale_term_is_rejected() {
    let cluster = bootstrapped_cluster().await;
    let a = cluster.node("a").unwrap();
    let c = cluster.node("c").unwrap();
    let stale_on_leader = a.write_path().leader_context();
    let stale_on_follower = c.write_path().leader_context();

    let new_term = cluster.raft().elect("b").unwrap();
    assert!(new_term > stale_on_leader.term);

    // Deposed leader proposing with its old term.
    let err = a
        .write_path()
        .submit(
            &stale_on_leader,
            Command::DeletePolicy { id: PolicyId::new() },
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotLeaderAnymore);
    assert_eq!(err.leader_hint(), Some("b"));

    // Follower forwarding to the old leader with the old term.
    let err = c
        .write_path()
        .submit(
            &stale_on_follower,
            Command::DeletePolicy { id: PolicyId::new() },
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotLeaderAnymore);

    // A fresh context succeeds.
    let fresh = c.write_path().leader_context();
    assert_eq!(fresh.leader.as_deref(), Some("b"));
    c.write_path()
        .submit(
            &fresh,
            Command::DeletePolicy { id: PolicyId::new() },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    cluster.shutdown().await;
}

// ============================================================================
// Timeout and Cancellation
// ============================================================================

#[tokio::test]
async fn test_timeout_then_eventual_commit() {
    let cluster = bootstrapped_cluster().await;
    let store = cluster.node("a").unwrap().store();
    cluster.raft().set_healthy("b", false).unwrap();
    cluster.raft().set_healthy("c", false).unwrap();

    let id = PolicyId::new();
    let err = store
        .create(&root(), PolicyCreate::new("slow", "").with_id(id.to_string()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Timeout);
    assert!(err.code().requires_reread());

    // Still invisible while the quorum is gone.
    let missing = store.read(&root(), &id, Consistency::Stale).await.unwrap_err();
    assert_eq!(missing.code(), ErrorCode::NotFound);

    cluster.raft().set_healthy("b", true).unwrap();
    let (policy, _) = store.read(&root(), &id, Consistency::Strong).await.unwrap();
    assert_eq!(policy.name, "slow");

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_cancelled_write_may_still_commit() {
    let cluster = bootstrapped_cluster().await;
    let store = cluster.node("a").unwrap().store();
    cluster.raft().set_healthy("b", false).unwrap();
    cluster.raft().set_healthy("c", false).unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let auth = root().with_cancel(cancel);

    let id = PolicyId::new();
    let err = store
        .create(&auth, PolicyCreate::new("cancelled", "").with_id(id.to_string()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Cancelled);

    cluster.raft().set_healthy("c", true).unwrap();
    let (policy, _) = store.read(&root(), &id, Consistency::Default).await.unwrap();
    assert_eq!(policy.name, "cancelled");

    cluster.shutdown().await;
}

// ============================================================================
// Replay
// ============================================================================

#[tokio::test]
async fn test_replay_from_file_rebuilds_identical_state() {
    let dir = tempfile::tempdir().unwrap();

    let (policies, tokens, applied) = {
        let storage: Arc<dyn LogStorage> = Arc::new(FileStorage::open(dir.path()).unwrap());
        let cluster = LocalCluster::start(["a"], storage, &options()).unwrap();
        cluster.raft().elect("a").unwrap();
        let node = cluster.node("a").unwrap();
        let store = node.store();
        store
            .bootstrap(Some(ROOT.to_string()), &CancellationToken::new())
            .await
            .unwrap();

        let kept = store
            .create(&root(), PolicyCreate::new("kept", r#"service "web" { policy = "read" }"#))
            .await
            .unwrap();
        let dropped = store.create(&root(), PolicyCreate::new("dropped", "")).await.unwrap();
        store
            .update(
                &root(),
                &kept.id,
                PolicyUpdate {
                    rules: Some(r#"service "web" { policy = "write" }"#.into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store.delete(&root(), &dropped.id).await.unwrap();
        store
            .create_token(&root(), TokenCreate::new(vec![kept.id]).with_secret("web-token"))
            .await
            .unwrap();

        let state = node.replica().state().read();
        let snapshot = (
            state.policies().cloned().collect::<Vec<_>>(),
            state.tokens().cloned().collect::<Vec<_>>(),
            state.applied_index(),
        );
        drop(state);
        cluster.shutdown().await;
        snapshot
    };

    let storage: Arc<dyn LogStorage> = Arc::new(FileStorage::open(dir.path()).unwrap());
    let restarted = LocalCluster::start(["a", "b"], storage, &options()).unwrap();
    for node in restarted.nodes() {
        let state = node.replica().state().read();
        assert_eq!(state.policies().cloned().collect::<Vec<_>>(), policies);
        assert_eq!(state.tokens().cloned().collect::<Vec<_>>(), tokens);
        assert_eq!(state.applied_index(), applied);
        assert!(state.is_bootstrapped());
    }

    // No leader after restart, but stale reads still serve the replayed state.
    let store = restarted.node("b").unwrap().store();
    let (by_name, meta) = store
        .read_by_name(&root(), None, "kept", Consistency::Stale)
        .await
        .unwrap();
    assert!(!meta.known_leader);
    assert_eq!(meta.index, applied);
    assert!(by_name.rules.contains("write"));

    // Terms continue from the log.
    let term = restarted.raft().elect("b").unwrap();
    assert!(term >= 2);

    restarted.shutdown().await;
}
