//! Benchmarks for graph validation and the deterministic embedder.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use ragpipe::adapter::{Capability, FnAdapter, hash_embedding};
use ragpipe::config::EngineConfig;
use ragpipe::graph::GraphBuilder;
use std::sync::Arc;

fn embedding_benchmark(c: &mut Criterion) {
    let text = "the quick brown fox jumps over the lazy dog ".repeat(20);
    c.bench_function("hash_embedding_64", |b| {
        b.iter(|| hash_embedding(black_box(&text), 64))
    });
}

fn graph_build_benchmark(c: &mut Criterion) {
    let config = EngineConfig::default();
    c.bench_function("build_linear_graph_8", |b| {
        b.iter(|| {
            let mut builder = GraphBuilder::new("bench");
            let mut upstream: Option<String> = None;
            for index in 0..8 {
                let name = format!("stage{index}");
                let adapter = Arc::new(FnAdapter::new(
                    name.clone(),
                    Capability::Custom,
                    |payload, _ctx| Ok(payload),
                ));
                builder = builder.stage(name.clone(), adapter, upstream.as_deref());
                upstream = Some(name);
            }
            black_box(builder.build(&config).unwrap())
        })
    });
}

criterion_group!(benches, embedding_benchmark, graph_build_benchmark);
criterion_main!(benches);
