//! Benchmarks for the rule compiler.
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use bastion_core::rules::compile;

const WEB_RULES: &str = r#"
# web tier
service "web" { policy = "write" }
service_prefix "" { policy = "read" }
node_prefix "" { policy = "read" }
key_prefix "web/" { policy = "list" }
operator = "read"
"#;

const WEB_RULES_JSON: &str = r#"{
  "service": {"web": {"policy": "write"}},
  "service_prefix": {"": {"policy": "read"}},
  "node_prefix": {"": {"policy": "read"}},
  "key_prefix": {"web/": {"policy": "list"}},
  "operator": "read"
}"#;

fn generated_rules(count: usize) -> String {
    (0..count)
        .map(|i| format!("service \"svc-{i}\" {{ policy = \"write\" }}\nkey_prefix \"app/{i}/\" {{ policy = \"read\" }}\n"))
        .collect()
}

fn bench_compile_formats(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile_formats");
    group.bench_function("block", |b| { b.iter(|| black_box(compile(black_box(WEB_RULES)).unwrap())); });
    group.bench_function("json", |b| { b.iter(|| black_box(compile(black_box(WEB_RULES_JSON)).unwrap())); });
    group.finish();
}

fn bench_compile_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile_scaling");
    for count in [10, 100, 1_000] {
        let text = generated_rules(count);
        group.throughput(Throughput::Bytes(text.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &text, |b, t| { b.iter(|| black_box(compile(t).unwrap())); });
    }
    group.finish();
}

fn bench_canonical_bytes(c: &mut Criterion) {
    let tree = compile(&generated_rules(100)).unwrap();
    c.bench_function("canonical_bytes_100", |b| { b.iter(|| black_box(tree.canonical_bytes())); });
}

criterion_group!(benches, bench_compile_formats, bench_compile_scaling, bench_canonical_bytes);
criterion_main!(benches);
