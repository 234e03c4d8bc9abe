//! Versioned landmark bases for the projector.
//!
//! A landmark set is a small number of unit reference vectors. The set keeps
//! the triangular factor of its Gram-Schmidt decomposition so the projector
//! can undo the overlap between near-orthogonal landmarks. Sets are
//! immutable once built; new bases are published as new versions.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use atomdb_core::error::{AtomError, Result};
use atomdb_core::types::Timestamp;
use atomdb_storage::LandmarkRecord;

pub const MIN_LANDMARKS: usize = 3;
pub const MAX_LANDMARKS: usize = 8;

/// Residual norm below which a landmark counts as linearly dependent on the
/// ones before it.
const DEPENDENCE_TOLERANCE: f64 = 1e-6;

/// Immutable projection basis.
#[derive(Debug, Clone, PartialEq)]
pub struct LandmarkSet {
    version: u32,
    dimension: usize,
    /// Unit-length landmarks.
    vectors: Vec<Vec<f64>>,
    /// `factor[i][j]` (j < i) is the overlap of landmark i with orthonormal
    /// direction j; `factor[i][i]` is its residual norm.
    factor: Vec<Vec<f64>>,
    valid_from: Timestamp,
}

impl LandmarkSet {
    /// Build from explicit landmark vectors. Each is normalized to unit length.
    pub fn from_vectors(version: u32, vectors: Vec<Vec<f64>>) -> Result<Self> {
        let dimension = check_shape(&vectors)?;
        let mut unit = Vec::with_capacity(vectors.len());
        for (i, mut v) in vectors.into_iter().enumerate() {
            if v.iter().any(|x| !x.is_finite()) {
                return Err(AtomError::Validation(format!("landmark {} is not finite", i)));
            }
            let n = norm(&v);
            if n == 0.0 {
                return Err(AtomError::Validation(format!("landmark {} is the zero vector", i)));
            }
            v.iter_mut().for_each(|x| *x /= n);
            unit.push(v);
        }
        Self::from_unit_vectors(version, dimension, unit, Utc::now())
    }

    /// Random orthonormal landmarks drawn from a seeded generator.
    pub fn generate(version: u32, dimension: usize, count: usize, seed: u64) -> Result<Self> {
        check_count(count, dimension)?;
        let mut rng = StdRng::seed_from_u64(seed);
        let mut basis: Vec<Vec<f64>> = Vec::with_capacity(count);
        while basis.len() < count {
            if let Some(v) = random_direction(&mut rng, dimension, &basis) {
                basis.push(v);
            }
        }
        Self::from_unit_vectors(version, dimension, basis, Utc::now())
    }

    /// Landmarks along the top principal directions of a sample.
    ///
    /// Sample vectors are normalized and mean-centred, then each direction is
    /// found by power iteration on the sample covariance, deflated against
    /// the directions already found. If the sample has fewer independent
    /// directions than requested, the rest are filled with seeded random
    /// orthogonal directions.
    pub fn from_sample<V: AsRef<[f32]>>(
        version: u32,
        sample: &[V],
        count: usize,
        iterations: usize,
        seed: u64,
    ) -> Result<Self> {
        let first = sample
            .first()
            .ok_or_else(|| AtomError::Validation("landmark sample is empty".to_string()))?;
        let dimension = first.as_ref().len();
        check_count(count, dimension)?;

        let mut rows: Vec<Vec<f64>> = Vec::with_capacity(sample.len());
        for v in sample {
            let v = v.as_ref();
            if v.len() != dimension {
                return Err(AtomError::DimensionMismatch {
                    expected: dimension,
                    actual: v.len(),
                });
            }
            let row: Vec<f64> = v.iter().map(|x| *x as f64).collect();
            let n = norm(&row);
            if n > 0.0 && n.is_finite() {
                rows.push(row.into_iter().map(|x| x / n).collect());
            }
        }

        let mut mean = vec![0.0; dimension];
        for row in &rows {
            for (m, x) in mean.iter_mut().zip(row) {
                *m += x;
            }
        }
        if !rows.is_empty() {
            let n = rows.len() as f64;
            mean.iter_mut().for_each(|m| *m /= n);
        }
        for row in &mut rows {
            for (x, m) in row.iter_mut().zip(&mean) {
                *x -= m;
            }
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let mut basis: Vec<Vec<f64>> = Vec::with_capacity(count);
        while basis.len() < count {
            let Some(mut u) = random_direction(&mut rng, dimension, &basis) else {
                continue;
            };
            let mut found = true;
            for _ in 0..iterations.max(1) {
                let mut w = vec![0.0; dimension];
                for row in &rows {
                    let proj = dot(row, &u);
                    for (wi, xi) in w.iter_mut().zip(row) {
                        *wi += proj * xi;
                    }
                }
                orthogonalize(&mut w, &basis);
                let n = norm(&w);
                if n < DEPENDENCE_TOLERANCE {
                    found = false;
                    break;
                }
                w.iter_mut().for_each(|x| *x /= n);
                u = w;
            }
            if !found {
                // Sample rank exhausted: keep the random direction.
                orthogonalize(&mut u, &basis);
                let n = norm(&u);
                if n < DEPENDENCE_TOLERANCE {
                    continue;
                }
                u.iter_mut().for_each(|x| *x /= n);
            }
            basis.push(u);
        }

        Self::from_unit_vectors(version, dimension, basis, Utc::now())
    }

    /// Rebuild a persisted set. Stored vectors are already unit length and
    /// are used bit-for-bit.
    pub fn from_record(record: &LandmarkRecord) -> Result<Self> {
        check_shape(&record.vectors)?;
        Self::from_unit_vectors(
            record.version,
            record.dimension,
            record.vectors.clone(),
            record.valid_from,
        )
    }

    pub fn to_record(&self) -> LandmarkRecord {
        LandmarkRecord {
            version: self.version,
            dimension: self.dimension,
            vectors: self.vectors.clone(),
            valid_from: self.valid_from,
        }
    }

    fn from_unit_vectors(
        version: u32,
        dimension: usize,
        vectors: Vec<Vec<f64>>,
        valid_from: Timestamp,
    ) -> Result<Self> {
        check_count(vectors.len(), dimension)?;
        let mut ortho: Vec<Vec<f64>> = Vec::with_capacity(vectors.len());
        let mut factor: Vec<Vec<f64>> = Vec::with_capacity(vectors.len());

        for (i, v) in vectors.iter().enumerate() {
            let mut residual = v.clone();
            let mut row = Vec::with_capacity(i + 1);
            for q in &ortho {
                let r = dot(q, v);
                for (x, qx) in residual.iter_mut().zip(q) {
                    *x -= r * qx;
                }
                row.push(r);
            }
            let r_ii = norm(&residual);
            if r_ii < DEPENDENCE_TOLERANCE {
                return Err(AtomError::Validation(format!(
                    "landmark {} is linearly dependent on the preceding landmarks",
                    i
                )));
            }
            residual.iter_mut().for_each(|x| *x /= r_ii);
            row.push(r_ii);
            ortho.push(residual);
            factor.push(row);
        }

        Ok(Self {
            version,
            dimension,
            vectors,
            factor,
            valid_from,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of landmarks, i.e. the dimensionality of spatial keys.
    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn vectors(&self) -> &[Vec<f64>] {
        &self.vectors
    }

    pub fn valid_from(&self) -> Timestamp {
        self.valid_from
    }

    /// Largest absolute cosine between two distinct landmarks.
    pub fn max_overlap(&self) -> f64 {
        let mut worst: f64 = 0.0;
        for i in 0..self.vectors.len() {
            for j in 0..i {
                worst = worst.max(dot(&self.vectors[i], &self.vectors[j]).abs());
            }
        }
        worst
    }

    /// Coordinates of a vector's direction in the orthonormalized landmark
    /// basis.
    ///
    /// The cosine to each landmark is corrected by subtracting the share
    /// already explained by earlier coordinates through the landmark's
    /// overlap with them. For an orthonormal set the result is the cosine
    /// itself. A zero vector maps to the origin.
    pub fn coordinates(&self, vector: &[f32]) -> Result<Vec<f64>> {
        if vector.len() != self.dimension {
            return Err(AtomError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        let v: Vec<f64> = vector.iter().map(|x| *x as f64).collect();
        let n = norm(&v);
        if !n.is_finite() {
            return Err(AtomError::Validation("vector is not finite".to_string()));
        }
        let mut coords = Vec::with_capacity(self.vectors.len());
        if n == 0.0 {
            coords.resize(self.vectors.len(), 0.0);
            return Ok(coords);
        }

        for (landmark, row) in self.vectors.iter().zip(&self.factor) {
            let similarity = dot(&v, landmark) / n;
            let i = coords.len();
            let explained: f64 = row[..i].iter().zip(&coords).map(|(r, c)| r * c).sum();
            coords.push((similarity - explained) / row[i]);
        }
        Ok(coords)
    }
}

/// Append-only registry of published landmark sets.
#[derive(Debug, Default)]
pub struct LandmarkRegistry {
    versions: RwLock<BTreeMap<u32, Arc<LandmarkSet>>>,
}

impl LandmarkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a set. Its version must be newer than every published one.
    pub fn publish(&self, set: LandmarkSet) -> Result<Arc<LandmarkSet>> {
        let mut versions = self
            .versions
            .write()
            .map_err(|e| AtomError::Storage(format!("Lock poisoned: {}", e)))?;
        if let Some((&latest, _)) = versions.last_key_value() {
            if set.version <= latest {
                return Err(AtomError::Validation(format!(
                    "landmark version {} is not newer than {}",
                    set.version, latest
                )));
            }
        }
        let set = Arc::new(set);
        versions.insert(set.version, Arc::clone(&set));
        info!(
            version = set.version,
            dimension = set.dimension,
            landmarks = set.len(),
            overlap = set.max_overlap(),
            "Landmark set published"
        );
        Ok(set)
    }

    pub fn get(&self, version: u32) -> Option<Arc<LandmarkSet>> {
        self.versions.read().ok()?.get(&version).cloned()
    }

    pub fn latest(&self) -> Option<Arc<LandmarkSet>> {
        self.versions.read().ok()?.values().next_back().cloned()
    }

    pub fn next_version(&self) -> u32 {
        self.latest().map_or(1, |s| s.version + 1)
    }

    pub fn versions(&self) -> Vec<u32> {
        self.versions
            .read()
            .map(|v| v.keys().copied().collect())
            .unwrap_or_default()
    }
}

fn check_count(count: usize, dimension: usize) -> Result<()> {
    if !(MIN_LANDMARKS..=MAX_LANDMARKS).contains(&count) {
        return Err(AtomError::Validation(format!(
            "landmark count must be in {}..={}, got {}",
            MIN_LANDMARKS, MAX_LANDMARKS, count
        )));
    }
    if count > dimension {
        return Err(AtomError::Validation(format!(
            "{} landmarks cannot be independent in {} dimensions",
            count, dimension
        )));
    }
    Ok(())
}

fn check_shape(vectors: &[Vec<f64>]) -> Result<usize> {
    let dimension = vectors.first().map_or(0, Vec::len);
    if let Some(v) = vectors.iter().find(|v| v.len() != dimension) {
        return Err(AtomError::DimensionMismatch {
            expected: dimension,
            actual: v.len(),
        });
    }
    check_count(vectors.len(), dimension)?;
    Ok(dimension)
}

/// A seeded unit vector orthogonal to `basis`, or `None` if the draw was
/// degenerate.
fn random_direction(rng: &mut StdRng, dimension: usize, basis: &[Vec<f64>]) -> Option<Vec<f64>> {
    let mut v: Vec<f64> = (0..dimension).map(|_| rng.random::<f64>() * 2.0 - 1.0).collect();
    orthogonalize(&mut v, basis);
    let n = norm(&v);
    if n < DEPENDENCE_TOLERANCE {
        return None;
    }
    v.iter_mut().for_each(|x| *x /= n);
    Some(v)
}

/// Modified Gram-Schmidt against an orthonormal basis.
fn orthogonalize(v: &mut [f64], basis: &[Vec<f64>]) {
    for b in basis {
        let p = dot(v, b);
        for (x, bx) in v.iter_mut().zip(b) {
            *x -= p * bx;
        }
    }
}

pub(crate) fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub(crate) fn norm(a: &[f64]) -> f64 {
    dot(a, a).sqrt()
}
