//! Integration tests for the atomdb engine.
//!
//! Covers dedup and overflow behavior of the store, projection properties,
//! the two-stage query against a brute-force baseline, and snapshot
//! isolation of queries during a rebuild. Each test builds its own engine
//! over an in-memory database.

use std::collections::HashSet;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use atomdb_core::budget::Budget;
use atomdb_core::config::AtomConfig;
use atomdb_core::types::{AtomId, Modality, ModelVersion, StoredValue};
use atomdb_spatial::kdtree::euclidean;
use atomdb_spatial::{
    cosine_similarity, AtomEngine, BatchItem, KnnQuery, LandmarkSet, LandmarkSource, Projector,
    ResultSource,
};

// =============================================================================
// Helpers
// =============================================================================

fn engine() -> AtomEngine {
    AtomEngine::in_memory(AtomConfig::default()).unwrap()
}

fn model() -> ModelVersion {
    ModelVersion::new("clustered@1")
}

fn gaussian(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.random::<f64>().max(f64::MIN_POSITIVE);
    let u2: f64 = rng.random::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

fn unit(v: Vec<f64>) -> Vec<f64> {
    let n = v.iter().map(|x| x * x).sum::<f64>().sqrt();
    v.into_iter().map(|x| x / n).collect()
}

fn to_f32(v: &[f64]) -> Vec<f32> {
    v.iter().map(|x| *x as f32).collect()
}

/// Unit vectors around a handful of centers inside a random low-dimensional
/// subspace, plus a little noise off the subspace. Draws with different
/// seeds come from the same clusters, so held-out queries share the
/// corpus distribution.
struct ClusterModel {
    basis: Vec<Vec<f64>>,
    centers: Vec<Vec<f64>>,
}

impl ClusterModel {
    fn new(dim: usize, intrinsic: usize, clusters: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let basis = (0..intrinsic)
            .map(|_| (0..dim).map(|_| gaussian(&mut rng)).collect())
            .collect();
        let centers = (0..clusters)
            .map(|_| (0..intrinsic).map(|_| gaussian(&mut rng)).collect())
            .collect();
        Self { basis, centers }
    }

    fn sample(&self, n: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        let dim = self.basis[0].len();
        (0..n)
            .map(|i| {
                let center = &self.centers[i % self.centers.len()];
                let mut v = vec![0.0; dim];
                for (coef, direction) in center.iter().zip(&self.basis) {
                    let c = coef + 0.25 * gaussian(&mut rng);
                    for (x, b) in v.iter_mut().zip(direction) {
                        *x += c * b;
                    }
                }
                for x in v.iter_mut() {
                    *x += 0.01 * gaussian(&mut rng);
                }
                to_f32(&unit(v))
            })
            .collect()
    }
}

/// Clustered vectors of intrinsic dimension 4.
fn clustered_corpus(n: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
    ClusterModel::new(dim, 4, 20, seed).sample(n, seed)
}

fn load_corpus(engine: &AtomEngine, corpus: &[Vec<f32>]) -> Vec<AtomId> {
    let items: Vec<BatchItem> = corpus
        .iter()
        .enumerate()
        .map(|(i, v)| BatchItem::new(format!("doc-{}", i).into_bytes(), Modality::Text).with_vector(v.clone()))
        .collect();
    let outcome = engine.put_batch(&items, Some(&model())).unwrap();
    outcome.items.iter().map(|r| r.id).collect()
}

fn exact_top_k(corpus: &[Vec<f32>], ids: &[AtomId], query: &[f32], k: usize) -> Vec<AtomId> {
    let mut scored: Vec<(f64, AtomId)> = corpus
        .iter()
        .zip(ids)
        .map(|(v, id)| (cosine_similarity(query, v), *id))
        .collect();
    scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    scored.into_iter().take(k).map(|(_, id)| id).collect()
}

// =============================================================================
// Store
// =============================================================================

#[test]
fn test_put_twice_returns_same_atom() {
    let engine = engine();
    let first = engine.put(b"hello", Modality::Text).unwrap();
    assert_eq!(first.id, AtomId(1));
    assert_eq!(first.refcount, 1);
    assert!(first.is_new);

    let second = engine.put(b"hello", Modality::Text).unwrap();
    assert_eq!(second.id, AtomId(1));
    assert_eq!(second.refcount, 2);
    assert!(!second.is_new);
}

#[test]
fn test_distinct_content_gets_distinct_atoms() {
    let engine = engine();
    let mut ids = HashSet::new();
    for i in 0..200u32 {
        let atom = engine.put(&i.to_le_bytes(), Modality::Binary).unwrap();
        assert!(ids.insert(atom.id));
    }
    assert_eq!(engine.stats().unwrap().atoms, 200);
}

#[test]
fn test_hundred_byte_buffer_uses_overflow() {
    let engine = engine();
    let content: Vec<u8> = (0..100u8).collect();
    let atom = engine.put(&content, Modality::Binary).unwrap();

    let stored = engine.atom(atom.id).unwrap().unwrap();
    assert!(matches!(stored.value, StoredValue::Overflow { .. }));
    assert_eq!(stored.byte_len, 100);
    assert_eq!(engine.get(atom.id).unwrap(), content);
}

#[test]
fn test_overflow_round_trip_across_sizes() {
    let engine = engine();
    let mut rng = StdRng::seed_from_u64(11);
    for len in [65usize, 100, 255, 4096, 70_000] {
        let content: Vec<u8> = (0..len).map(|_| rng.random()).collect();
        let atom = engine.put(&content, Modality::Weight).unwrap();
        assert_eq!(engine.get(atom.id).unwrap(), content, "length {}", len);
    }
}

#[test]
fn test_concurrent_puts_yield_one_atom() {
    let engine = Arc::new(engine());
    let n: u64 = 16;
    std::thread::scope(|scope| {
        for _ in 0..n {
            let engine = Arc::clone(&engine);
            scope.spawn(move || {
                engine.put(b"shared content", Modality::Text).unwrap();
            });
        }
    });

    let stats = engine.stats().unwrap();
    assert_eq!(stats.atoms, 1);
    let atom = engine.atom(AtomId(1)).unwrap().unwrap();
    assert_eq!(atom.refcount, n);
}

// =============================================================================
// Projection
// =============================================================================

#[test]
fn test_close_and_far_pairs_with_fixed_landmarks() {
    let dim = 8;
    let axis = |i: usize| {
        let mut v = vec![0.0; dim];
        v[i] = 1.0;
        v
    };
    let landmarks = LandmarkSet::from_vectors(1, (0..4).map(axis).collect()).unwrap();
    let projector = Projector::new(Arc::new(landmarks), 10.0, 16).unwrap();

    // Cosine 0.99, with the difference outside the landmark span.
    let a = to_f32(&axis(0));
    let mut b = vec![0.0f32; dim];
    b[0] = 0.99;
    b[4] = (1.0f32 - 0.99 * 0.99).sqrt();
    assert!((cosine_similarity(&a, &b) - 0.99).abs() < 1e-6);

    // Cosine 0.01.
    let mut c = vec![0.0f32; dim];
    c[0] = 0.01;
    c[1] = (1.0f32 - 0.01 * 0.01).sqrt();
    assert!((cosine_similarity(&a, &c) - 0.01).abs() < 1e-6);

    let pa = projector.project(&a).unwrap();
    let pb = projector.project(&b).unwrap();
    let pc = projector.project(&c).unwrap();
    assert!(euclidean(&pa, &pb) < 0.5);
    assert!(euclidean(&pa, &pc) > 5.0);
}

#[test]
fn test_projection_is_deterministic_across_reload() {
    let set = LandmarkSet::generate(3, 32, 4, 99).unwrap();
    let reloaded = LandmarkSet::from_record(&set.to_record()).unwrap();
    let first = Projector::new(Arc::new(set), 1.0, 16).unwrap();
    let second = Projector::new(Arc::new(reloaded), 1.0, 16).unwrap();

    let corpus = clustered_corpus(50, 32, 5);
    for v in &corpus {
        let a = first.project_to_key(v, None).unwrap();
        let b = second.project_to_key(v, None).unwrap();
        let bits = |coords: &[f64]| coords.iter().map(|c| c.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&a.coords), bits(&b.coords));
        assert_eq!(a.locality, b.locality);
        assert_eq!(a.landmark_version, 3);
    }
}

#[test]
fn test_similar_pairs_stay_close_after_projection() {
    let dim = 32;
    let mut rng = StdRng::seed_from_u64(21);
    let projector = Projector::new(Arc::new(LandmarkSet::generate(1, dim, 4, 8).unwrap()), 1.0, 16).unwrap();
    let threshold = 0.45;

    let mut sampled = 0;
    let mut close = 0;
    while sampled < 500 {
        let base = unit((0..dim).map(|_| gaussian(&mut rng)).collect());
        let noise = 0.05 + 0.2 * rng.random::<f64>();
        let other = unit(base.iter().map(|x| x + noise * gaussian(&mut rng) / (dim as f64).sqrt()).collect());
        let (a, b) = (to_f32(&base), to_f32(&other));
        if cosine_similarity(&a, &b) <= 0.9 {
            continue;
        }
        sampled += 1;
        let distance = euclidean(&projector.project(&a).unwrap(), &projector.project(&b).unwrap());
        if distance < threshold {
            close += 1;
        }
    }
    assert!(close * 100 >= sampled * 85, "{} of {} pairs close", close, sampled);
}

// =============================================================================
// Queries
// =============================================================================

/// Fraction of the exact top-k found by the engine, over all queries, and
/// the mean number of vectors scored per query.
fn measure_recall(
    engine: &AtomEngine,
    corpus: &[Vec<f32>],
    ids: &[AtomId],
    queries: &[Vec<f32>],
    k: usize,
) -> (f64, usize) {
    let mut hits = 0;
    let mut scored = 0;
    for query in queries {
        let expected: HashSet<AtomId> = exact_top_k(corpus, ids, query, k).into_iter().collect();
        let result = engine.k_nearest(&KnnQuery::new(query.clone(), k, model())).unwrap();
        assert_eq!(result.source, ResultSource::Index);
        assert_eq!(result.neighbors.len(), k);
        scored += result.candidates;
        hits += result
            .neighbors
            .iter()
            .filter(|n| expected.contains(&n.atom_id))
            .count();
    }
    (
        hits as f64 / (queries.len() * k) as f64,
        scored / queries.len(),
    )
}

#[test]
fn test_recall_against_brute_force() {
    let engine = engine();
    let clusters = ClusterModel::new(32, 4, 20, 1);
    let corpus = clusters.sample(3000, 10);
    let ids = load_corpus(&engine, &corpus);
    engine
        .publish_landmarks(LandmarkSource::Sample { model: model() })
        .unwrap();
    let report = engine.rebuild_index(&model(), &Budget::unlimited()).unwrap();
    assert_eq!(report.atoms, 3000);

    let (recall, _) = measure_recall(&engine, &corpus, &ids, &clusters.sample(50, 11), 10);
    assert!(recall >= 0.9, "recall {}", recall);
}

#[test]
fn test_recall_with_random_landmarks_in_higher_dimension() {
    // 16 intrinsic dimensions in 64: four random landmarks see far less of
    // the structure than sampled principal directions would.
    let clusters = ClusterModel::new(64, 16, 20, 7);
    let corpus = clusters.sample(3000, 70);
    let queries = clusters.sample(40, 71);

    let engine = engine();
    let ids = load_corpus(&engine, &corpus);
    engine
        .publish_landmarks(LandmarkSource::Random { dimension: 64 })
        .unwrap();
    engine.rebuild_index(&model(), &Budget::unlimited()).unwrap();
    let (recall, scored) = measure_recall(&engine, &corpus, &ids, &queries, 10);
    assert!(recall >= 0.85, "recall {} with 4 random landmarks", recall);
    assert!(scored < corpus.len() / 4, "{} vectors scored per query", scored);

    // Eight landmarks at 8 locality bits each.
    let mut config = AtomConfig::default();
    config.projection.landmark_count = 8;
    config.projection.locality_bits = 8;
    let engine = AtomEngine::in_memory(config).unwrap();
    let ids = load_corpus(&engine, &corpus);
    engine
        .publish_landmarks(LandmarkSource::Random { dimension: 64 })
        .unwrap();
    engine.rebuild_index(&model(), &Budget::unlimited()).unwrap();
    let (recall, scored) = measure_recall(&engine, &corpus, &ids, &queries, 10);
    assert!(recall >= 0.95, "recall {} with 8 random landmarks", recall);
    assert!(scored < corpus.len() / 4, "{} vectors scored per query", scored);
}

#[test]
fn test_refined_results_are_exactly_ordered() {
    let mut config = AtomConfig::default();
    config.query.max_candidates = 24;
    let engine = AtomEngine::in_memory(config).unwrap();
    let corpus = clustered_corpus(500, 32, 2);
    let ids = load_corpus(&engine, &corpus);
    engine
        .publish_landmarks(LandmarkSource::Random { dimension: 32 })
        .unwrap();
    engine.rebuild_index(&model(), &Budget::unlimited()).unwrap();

    for query in clustered_corpus(20, 32, 3) {
        let result = engine.k_nearest(&KnnQuery::new(query.clone(), 10, model())).unwrap();
        assert!(result.candidates <= 24);
        for pair in result.neighbors.windows(2) {
            assert!(
                pair[0].score > pair[1].score
                    || (pair[0].score == pair[1].score && pair[0].atom_id < pair[1].atom_id)
            );
        }
        for neighbor in &result.neighbors {
            let position = ids.iter().position(|id| *id == neighbor.atom_id).unwrap();
            assert_eq!(neighbor.score, cosine_similarity(&query, &corpus[position]));
        }
    }
}

#[test]
fn test_linear_scan_without_index_is_exact() {
    let engine = engine();
    let corpus = clustered_corpus(300, 32, 4);
    let ids = load_corpus(&engine, &corpus);

    let query = corpus[17].clone();
    let result = engine.k_nearest(&KnnQuery::new(query.clone(), 5, model())).unwrap();
    assert!(result.is_degraded());
    assert!(result.degraded_reason.is_some());
    assert_eq!(result.landmark_version, None);

    let got: Vec<AtomId> = result.neighbors.iter().map(|n| n.atom_id).collect();
    assert_eq!(got, exact_top_k(&corpus, &ids, &query, 5));
    assert_eq!(got[0], ids[17]);
}

#[test]
fn test_query_holding_snapshot_ignores_concurrent_rebuild() {
    let engine = Arc::new(engine());
    let corpus = clustered_corpus(800, 32, 6);
    load_corpus(&engine, &corpus);
    engine
        .publish_landmarks(LandmarkSource::Random { dimension: 32 })
        .unwrap();
    engine.rebuild_index(&model(), &Budget::unlimited()).unwrap();

    let pinned = engine.index(&model()).unwrap();
    let query = KnnQuery::new(corpus[0].clone(), 10, model());

    std::thread::scope(|scope| {
        let rebuilder = {
            let engine = Arc::clone(&engine);
            scope.spawn(move || {
                engine
                    .publish_landmarks(LandmarkSource::Sample { model: model() })
                    .unwrap();
                engine.rebuild_index(&model(), &Budget::unlimited()).unwrap()
            })
        };
        for _ in 0..20 {
            let result = engine.k_nearest_in(&pinned, &query).unwrap();
            assert_eq!(result.landmark_version, Some(1));
            assert_eq!(result.partition_version, Some(1));
        }
        let report = rebuilder.join().unwrap();
        assert_eq!(report.landmark_version, 2);
        assert_eq!(report.partition_version, 2);
    });

    // The pinned snapshot is untouched; new queries see the new one.
    assert_eq!(pinned.partition_version(), 1);
    let fresh = engine.k_nearest(&query).unwrap();
    assert_eq!(fresh.landmark_version, Some(2));
    assert_eq!(fresh.partition_version, Some(2));
}

#[test]
fn test_queries_during_rebuilds_see_consistent_versions() {
    let engine = Arc::new(engine());
    let corpus = clustered_corpus(600, 32, 7);
    load_corpus(&engine, &corpus);
    engine
        .publish_landmarks(LandmarkSource::Random { dimension: 32 })
        .unwrap();
    engine.rebuild_index(&model(), &Budget::unlimited()).unwrap();

    std::thread::scope(|scope| {
        let writer = Arc::clone(&engine);
        scope.spawn(move || {
            for _ in 0..3 {
                writer
                    .publish_landmarks(LandmarkSource::Random { dimension: 32 })
                    .unwrap();
                writer.rebuild_index(&model(), &Budget::unlimited()).unwrap();
            }
        });
        for i in 0..100 {
            let result = engine
                .k_nearest(&KnnQuery::new(corpus[i % corpus.len()].clone(), 5, model()))
                .unwrap();
            // Partition version n is always built under landmark version n
            // here, since each publish is followed by exactly one rebuild.
            assert_eq!(result.landmark_version, result.partition_version);
            assert_eq!(result.neighbors.len(), 5);
        }
    });
}

// =============================================================================
// Background keys
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_key_worker_indexes_late_vectors() {
    let engine = engine();
    let corpus = clustered_corpus(200, 32, 8);
    load_corpus(&engine, &corpus[..150]);
    engine
        .publish_landmarks(LandmarkSource::Random { dimension: 32 })
        .unwrap();
    engine
        .rebuild_index_async(&model(), Budget::unlimited())
        .await
        .unwrap();

    let handle = engine.spawn_key_worker().unwrap();
    assert!(engine.spawn_key_worker().is_err());

    let mut late = Vec::new();
    for (i, v) in corpus[150..].iter().enumerate() {
        let atom = engine
            .put_with_vector(format!("late-{}", i).as_bytes(), Modality::Text, &model(), v)
            .unwrap();
        late.push(atom.id);
    }
    engine.flush_keys().await;
    assert_eq!(engine.pending_keys(), 0);

    let index = engine.index(&model()).unwrap();
    assert_eq!(index.len(), 200);
    assert!(late.iter().all(|id| index.contains(*id)));

    let result = engine
        .k_nearest(&KnnQuery::new(corpus[160].clone(), 1, model()))
        .unwrap();
    assert_eq!(result.neighbors[0].atom_id, late[10]);
    handle.abort();
}
