//! In-memory cache of full-precision embedding vectors.
//!
//! Holds one table per model version. Stage B scoring and the linear-scan
//! fallback read from here; the SQLite embeddings table is the durable copy
//! loaded at startup.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use atomdb_core::budget::{Budget, Interrupt};
use atomdb_core::error::{AtomError, Result};
use atomdb_core::types::{AtomId, ModelVersion, Neighbor};

/// Budget is polled once per this many scored vectors.
pub(crate) const CHECK_EVERY: usize = 256;

/// Vectors stored under one model version. The first vector fixes the
/// dimension.
#[derive(Debug)]
pub struct ModelVectors {
    dimension: usize,
    entries: RwLock<HashMap<AtomId, Arc<[f32]>>>,
}

impl ModelVectors {
    fn new(dimension: usize) -> Self {
        Self {
            dimension,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn get(&self, id: AtomId) -> Option<Arc<[f32]>> {
        self.entries.read().ok()?.get(&id).cloned()
    }

    pub fn contains(&self, id: AtomId) -> bool {
        self.entries.read().map(|e| e.contains_key(&id)).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every (id, vector) pair, ordered by atom id.
    pub fn snapshot(&self) -> Result<Vec<(AtomId, Arc<[f32]>)>> {
        let entries = self
            .entries
            .read()
            .map_err(|e| AtomError::Storage(format!("Lock poisoned: {}", e)))?;
        let mut out: Vec<_> = entries.iter().map(|(id, v)| (*id, Arc::clone(v))).collect();
        out.sort_by_key(|(id, _)| *id);
        Ok(out)
    }

    /// Exact top-k over every stored vector.
    ///
    /// Returns the ranked neighbors and, if the budget ran out part way,
    /// why; the ranking then covers only the vectors scored so far. The
    /// table lock is released before scoring starts, so writers are not held
    /// up by a long scan.
    pub fn scan(&self, query: &[f32], k: usize, budget: &Budget) -> Result<(Vec<Neighbor>, Option<Interrupt>)> {
        let entries: Vec<(AtomId, Arc<[f32]>)> = self
            .entries
            .read()
            .map_err(|e| AtomError::Storage(format!("Lock poisoned: {}", e)))?
            .iter()
            .map(|(id, v)| (*id, Arc::clone(v)))
            .collect();

        let mut scored = Vec::with_capacity(entries.len());
        let mut interrupt = None;
        for (i, (id, vector)) in entries.into_iter().enumerate() {
            if i % CHECK_EVERY == 0 {
                interrupt = budget.check();
                if interrupt.is_some() {
                    break;
                }
            }
            scored.push(Neighbor {
                atom_id: id,
                score: cosine_similarity(query, &vector),
            });
        }
        Ok((rank(scored, k), interrupt))
    }
}

/// Per-model vector tables.
#[derive(Debug, Default)]
pub struct VectorStore {
    models: RwLock<HashMap<ModelVersion, Arc<ModelVectors>>>,
}

impl VectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table for a model, if any vector has been stored under it.
    pub fn model(&self, model: &ModelVersion) -> Option<Arc<ModelVectors>> {
        self.models.read().ok()?.get(model).cloned()
    }

    pub fn dimension(&self, model: &ModelVersion) -> Option<usize> {
        self.model(model).map(|m| m.dimension)
    }

    /// Check a vector against the model's dimension without storing it.
    pub fn check(&self, model: &ModelVersion, vector: &[f32]) -> Result<()> {
        validate_vector(vector)?;
        match self.dimension(model) {
            Some(expected) if expected != vector.len() => Err(AtomError::DimensionMismatch {
                expected,
                actual: vector.len(),
            }),
            _ => Ok(()),
        }
    }

    /// Cache a vector. Returns `false` if the atom already had one for
    /// this model; the cached vector is left as it was.
    pub fn insert(&self, model: &ModelVersion, id: AtomId, vector: Arc<[f32]>) -> Result<bool> {
        self.check(model, &vector)?;
        let table = {
            let mut models = self
                .models
                .write()
                .map_err(|e| AtomError::Storage(format!("Lock poisoned: {}", e)))?;
            Arc::clone(
                models
                    .entry(model.clone())
                    .or_insert_with(|| Arc::new(ModelVectors::new(vector.len()))),
            )
        };
        if table.dimension != vector.len() {
            return Err(AtomError::DimensionMismatch {
                expected: table.dimension,
                actual: vector.len(),
            });
        }
        let mut entries = table
            .entries
            .write()
            .map_err(|e| AtomError::Storage(format!("Lock poisoned: {}", e)))?;
        if entries.contains_key(&id) {
            return Ok(false);
        }
        entries.insert(id, vector);
        Ok(true)
    }

    /// Drop vectors for atoms that no longer exist, across all models.
    pub fn remove_atoms(&self, ids: &[AtomId]) -> usize {
        let Ok(models) = self.models.read() else {
            return 0;
        };
        let mut removed = 0;
        for table in models.values() {
            if let Ok(mut entries) = table.entries.write() {
                removed += ids.iter().filter(|id| entries.remove(*id).is_some()).count();
            }
        }
        removed
    }

    /// Forget a model entirely.
    pub fn remove_model(&self, model: &ModelVersion) -> Option<Arc<ModelVectors>> {
        self.models.write().ok()?.remove(model)
    }

    pub fn models(&self) -> Vec<ModelVersion> {
        let mut names: Vec<ModelVersion> = self
            .models
            .read()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

/// Reject vectors that cannot be scored.
pub fn validate_vector(vector: &[f32]) -> Result<()> {
    if vector.is_empty() {
        return Err(AtomError::Validation("vector is empty".to_string()));
    }
    if let Some(pos) = vector.iter().position(|v| !v.is_finite()) {
        return Err(AtomError::Validation(format!(
            "vector component {} is not finite",
            pos
        )));
    }
    Ok(())
}

/// Sort by descending score, ties by ascending atom id, and keep `k`.
pub fn rank(mut neighbors: Vec<Neighbor>, k: usize) -> Vec<Neighbor> {
    neighbors.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.atom_id.cmp(&b.atom_id))
    });
    neighbors.truncate(k);
    neighbors
}

/// Compute cosine similarity between two vectors.
///
/// Returns 0.0 if either vector has zero magnitude or the lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| (*x as f64) * (*y as f64))
        .sum();

    let mag_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let mag_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }

    dot / (mag_a * mag_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use atomdb_core::budget::CancelFlag;

    fn model() -> ModelVersion {
        ModelVersion::new("m")
    }

    fn vector(values: &[f32]) -> Arc<[f32]> {
        Arc::from(values)
    }

    #[test]
    fn test_insert_fixes_dimension() {
        let store = VectorStore::new();
        assert!(store.insert(&model(), AtomId(1), vector(&[1.0, 0.0])).unwrap());
        assert!(!store.insert(&model(), AtomId(1), vector(&[0.0, 1.0])).unwrap());

        let err = store.insert(&model(), AtomId(2), vector(&[1.0, 0.0, 0.0])).unwrap_err();
        assert!(matches!(err, AtomError::DimensionMismatch { expected: 2, actual: 3 }));
        assert_eq!(store.model(&model()).unwrap().get(AtomId(1)).unwrap()[0], 1.0);
    }

    #[test]
    fn test_rejects_non_finite() {
        let store = VectorStore::new();
        let err = store.insert(&model(), AtomId(1), vector(&[f32::NAN])).unwrap_err();
        assert!(matches!(err, AtomError::Validation(_)));
        assert!(store.check(&model(), &[]).is_err());
    }

    #[test]
    fn test_scan_ranks_and_breaks_ties_by_id() {
        let store = VectorStore::new();
        store.insert(&model(), AtomId(3), vector(&[1.0, 0.0])).unwrap();
        store.insert(&model(), AtomId(1), vector(&[1.0, 0.0])).unwrap();
        store.insert(&model(), AtomId(2), vector(&[0.0, 1.0])).unwrap();
        store.insert(&model(), AtomId(4), vector(&[-1.0, 0.0])).unwrap();

        let table = store.model(&model()).unwrap();
        let (hits, interrupt) = table.scan(&[2.0, 0.0], 3, &Budget::unlimited()).unwrap();
        assert!(interrupt.is_none());
        let ids: Vec<AtomId> = hits.iter().map(|h| h.atom_id).collect();
        assert_eq!(ids, vec![AtomId(1), AtomId(3), AtomId(2)]);
        assert!((hits[0].score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_scan_cancelled_returns_partial() {
        let store = VectorStore::new();
        store.insert(&model(), AtomId(1), vector(&[1.0])).unwrap();
        let flag = CancelFlag::new();
        flag.cancel();
        let table = store.model(&model()).unwrap();
        let (hits, interrupt) = table
            .scan(&[1.0], 5, &Budget::unlimited().with_cancel(flag))
            .unwrap();
        assert!(hits.is_empty());
        assert_eq!(interrupt, Some(Interrupt::Cancelled));
    }

    #[test]
    fn test_scan_does_not_hold_up_writers() {
        let store = Arc::new(VectorStore::new());
        for id in 0..2_000 {
            store
                .insert(&model(), AtomId(id), vector(&[id as f32, 1.0, -1.0]))
                .unwrap();
        }
        let table = store.model(&model()).unwrap();
        std::thread::scope(|scope| {
            let reader = scope.spawn(|| {
                (0..20)
                    .map(|_| table.scan(&[1.0, 0.0, 0.0], 3, &Budget::unlimited()).unwrap().0)
                    .last()
                    .unwrap()
            });
            for id in 2_000..2_500 {
                assert!(store
                    .insert(&model(), AtomId(id), vector(&[id as f32, 1.0, -1.0]))
                    .unwrap());
            }
            let hits = reader.join().unwrap();
            assert_eq!(hits.len(), 3);
        });
        assert_eq!(table.len(), 2_500);
    }

    #[test]
    fn test_remove_atoms_and_model() {
        let store = VectorStore::new();
        let other = ModelVersion::new("other");
        store.insert(&model(), AtomId(1), vector(&[1.0])).unwrap();
        store.insert(&other, AtomId(1), vector(&[1.0, 2.0])).unwrap();
        store.insert(&other, AtomId(2), vector(&[1.0, 2.0])).unwrap();

        assert_eq!(store.remove_atoms(&[AtomId(1)]), 2);
        assert!(store.model(&model()).unwrap().is_empty());
        assert_eq!(store.model(&other).unwrap().len(), 1);

        assert!(store.remove_model(&other).is_some());
        assert_eq!(store.models(), vec![model()]);
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let store = VectorStore::new();
        for id in [5, 2, 9] {
            store.insert(&model(), AtomId(id), vector(&[id as f32])).unwrap();
        }
        let ids: Vec<i64> = store
            .model(&model())
            .unwrap()
            .snapshot()
            .unwrap()
            .iter()
            .map(|(id, _)| id.0)
            .collect();
        assert_eq!(ids, vec![2, 5, 9]);
    }

    #[test]
    fn test_cosine_similarity_edge_cases() {
        assert!((cosine_similarity(&[1.0; 10], &[1.0; 10]) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-12);
        assert_eq!(cosine_similarity(&[0.0; 4], &[1.0; 4]), 0.0);
        assert_eq!(cosine_similarity(&[1.0; 3], &[1.0; 4]), 0.0);
    }
}
