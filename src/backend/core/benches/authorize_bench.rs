//! Benchmarks for authorization decisions.
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use bastion_core::acl::{effective_level, evaluate, AuthContext, PolicyCreate, Resource, TokenCreate};
use bastion_core::node::{LocalCluster, NodeOptions};
use bastion_core::rules::{compile, AccessLevel, ResourceKind, RuleTree};
use tokio_util::sync::CancellationToken;

fn trees(policies: usize, rules_per_policy: usize) -> Vec<RuleTree> {
    (0..policies)
        .map(|p| {
            let text: String = (0..rules_per_policy)
                .map(|r| format!("service_prefix \"svc-{p}-{r}\" {{ policy = \"read\" }}\nservice \"svc-{p}-{r}-exact\" {{ policy = \"write\" }}\n"))
                .collect();
            compile(&text).unwrap()
        })
        .collect()
}

fn bench_evaluate(c: &mut Criterion) {
    let mut group = c.benchmark_group("evaluate");
    for (policies, rules) in [(1, 10), (5, 10), (5, 100), (20, 100)] {
        let trees = trees(policies, rules);
        let hit = Resource::new(ResourceKind::Service, "svc-0-0-exact");
        let miss = Resource::new(ResourceKind::Service, "unrelated");
        let label = format!("{}x{}", policies, rules);
        group.bench_with_input(BenchmarkId::new("exact_hit", &label), &trees, |b, t| { b.iter(|| black_box(evaluate(t, &hit, AccessLevel::Write))); });
        group.bench_with_input(BenchmarkId::new("miss", &label), &trees, |b, t| { b.iter(|| black_box(effective_level(t, &miss))); });
    }
    group.finish();
}

fn bench_authorizer(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let cluster = rt.block_on(async {
        let cluster = LocalCluster::in_memory(["bench"], &NodeOptions::default()).unwrap();
        cluster.raft().elect("bench").unwrap();
        let store = cluster.node("bench").unwrap().store();
        store.bootstrap(Some("root".into()), &CancellationToken::new()).await.unwrap();
        let root = AuthContext::new("root");
        let policy = store
            .create(&root, PolicyCreate::new("bench", r#"service_prefix "" { policy = "read" } service "web" { policy = "write" }"#))
            .await
            .unwrap();
        store.create_token(&root, TokenCreate::new(vec![policy.id]).with_secret("bench-token")).await.unwrap();
        cluster
    });
    let authz = cluster.node("bench").unwrap().authorizer();
    let web = Resource::new(ResourceKind::Service, "web");

    let mut group = c.benchmark_group("authorizer");
    group.bench_function("cached", |b| { b.iter(|| black_box(authz.authorize("bench-token", &web, AccessLevel::Write).unwrap())); });
    group.bench_function("uncached", |b| { b.iter(|| { authz.invalidate(); black_box(authz.authorize("bench-token", &web, AccessLevel::Write).unwrap()) }); });
    group.bench_function("unknown_token", |b| { b.iter(|| black_box(authz.authorize_or_deny("missing", &web, AccessLevel::Read))); });
    group.finish();

    rt.block_on(cluster.shutdown());
}

criterion_group!(benches, bench_evaluate, bench_authorizer);
criterion_main!(benches);
