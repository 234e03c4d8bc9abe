//! Benchmarks for k-nearest-neighbor queries.
//!
//! Compares the two-stage indexed query against the exact linear scan the
//! engine falls back to when no index is installed, and times a full
//! rebuild of the partition set and shards.
//!
//! # Dataset Size
//!
//! The default corpus is 5,000 vectors of dimension 64 for CI speed. Set
//! `BENCH_FULL_SCALE=1` to run with 50,000:
//!
//! ```bash
//! BENCH_FULL_SCALE=1 cargo bench -p atomdb-spatial
//! ```

use std::time::Duration;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use atomdb_core::budget::Budget;
use atomdb_core::config::AtomConfig;
use atomdb_core::types::{Modality, ModelVersion};
use atomdb_spatial::{AtomEngine, BatchItem, KnnQuery, LandmarkSource};

const CI_VECTOR_COUNT: usize = 5_000;
const FULL_SCALE_VECTOR_COUNT: usize = 50_000;
const DIMENSION: usize = 64;
const QUERY_COUNT: usize = 64;

fn vector_count() -> usize {
    if std::env::var("BENCH_FULL_SCALE").is_ok() {
        FULL_SCALE_VECTOR_COUNT
    } else {
        CI_VECTOR_COUNT
    }
}

fn model() -> ModelVersion {
    ModelVersion::new("bench@1")
}

/// Unit vectors clustered around random centers with per-component noise.
fn clustered_vectors(n: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let centers: Vec<Vec<f32>> = (0..32)
        .map(|_| (0..DIMENSION).map(|_| rng.random_range(-1.0f32..1.0)).collect())
        .collect();
    (0..n)
        .map(|i| {
            let center = &centers[i % centers.len()];
            let v: Vec<f32> = center
                .iter()
                .map(|c| c + rng.random_range(-0.2f32..0.2))
                .collect();
            let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            v.into_iter().map(|x| x / norm).collect()
        })
        .collect()
}

/// Engine loaded with `count` vectors, with or without an index.
fn populated_engine(count: usize, indexed: bool) -> AtomEngine {
    let engine = AtomEngine::in_memory(AtomConfig::default()).expect("Failed to open engine");
    let items: Vec<BatchItem> = clustered_vectors(count, 1)
        .into_iter()
        .enumerate()
        .map(|(i, v)| BatchItem::new(format!("atom-{}", i).into_bytes(), Modality::Text).with_vector(v))
        .collect();
    engine.put_batch(&items, Some(&model())).expect("batch put failed");

    if indexed {
        engine
            .publish_landmarks(LandmarkSource::Sample { model: model() })
            .expect("landmark publish failed");
        engine
            .rebuild_index(&model(), &Budget::unlimited())
            .expect("rebuild failed");
    }
    engine
}

fn bench_k_nearest(c: &mut Criterion) {
    let count = vector_count();
    let indexed = populated_engine(count, true);
    let scanned = populated_engine(count, false);
    let queries = clustered_vectors(QUERY_COUNT, 2);

    let mut group = c.benchmark_group("k_nearest");
    group.sample_size(50);
    group.measurement_time(Duration::from_secs(10));

    let mut i = 0;
    group.bench_function(format!("indexed_top10_{}vectors", count), |b| {
        b.iter(|| {
            i = (i + 1) % queries.len();
            let result = indexed
                .k_nearest(&KnnQuery::new(queries[i].clone(), 10, model()))
                .expect("query failed");
            assert!(!result.is_degraded());
            result
        });
    });

    let mut i = 0;
    group.bench_function(format!("linear_scan_top10_{}vectors", count), |b| {
        b.iter(|| {
            i = (i + 1) % queries.len();
            let result = scanned
                .k_nearest(&KnnQuery::new(queries[i].clone(), 10, model()))
                .expect("query failed");
            assert!(result.is_degraded());
            result
        });
    });

    group.finish();
}

fn bench_rebuild(c: &mut Criterion) {
    let count = vector_count();
    let engine = populated_engine(count, false);
    engine
        .publish_landmarks(LandmarkSource::Random { dimension: DIMENSION })
        .expect("landmark publish failed");

    let mut group = c.benchmark_group("rebuild");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(20));

    group.bench_function(format!("rebuild_{}vectors", count), |b| {
        b.iter_batched(
            Budget::unlimited,
            |budget| engine.rebuild_index(&model(), &budget).expect("rebuild failed"),
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(benches, bench_k_nearest, bench_rebuild);
criterion_main!(benches);
