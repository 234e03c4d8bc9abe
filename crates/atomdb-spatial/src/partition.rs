//! Coarse partitioning of spatial keys.
//!
//! A partition set is a list of centroids in spatial-key space produced by
//! seeded k-means++ over a sample of keys. Assignment is a linear scan over
//! the centroids. Sets are immutable and versioned per model; a rebuild
//! produces a new set rather than editing the old one.

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use atomdb_core::budget::Budget;
use atomdb_core::config::PartitionConfig;
use atomdb_core::error::{AtomError, Result};
use atomdb_core::types::{ModelVersion, Timestamp};
use atomdb_storage::PartitionRecord;

/// Clustering parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KMeansParams {
    pub k: usize,
    pub max_iterations: usize,
    pub tolerance: f64,
    pub seed: u64,
}

impl KMeansParams {
    /// Parameters for a corpus of `n` keys: k is about sqrt(n), capped by
    /// `max_partitions`.
    pub fn for_corpus(n: usize, config: &PartitionConfig) -> Self {
        Self {
            k: choose_k(n, config.max_partitions),
            max_iterations: config.max_iterations,
            tolerance: config.tolerance,
            seed: config.seed,
        }
    }
}

/// `round(sqrt(n))`, clamped to `1..=max`.
pub fn choose_k(n: usize, max: usize) -> usize {
    ((n as f64).sqrt().round() as usize).clamp(1, max.max(1))
}

/// Immutable centroid set for one model under one landmark version.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionSet {
    version: u32,
    landmark_version: u32,
    centroids: Vec<Vec<f64>>,
    iterations: u32,
    converged: bool,
    valid_from: Timestamp,
}

impl PartitionSet {
    /// Cluster `sample` into at most `params.k` partitions.
    ///
    /// Fewer centroids come back when the sample has fewer distinct points.
    /// Returns `Cancelled` if the budget runs out; nothing is produced.
    pub fn build(
        version: u32,
        landmark_version: u32,
        sample: &[Vec<f64>],
        params: KMeansParams,
        budget: &Budget,
    ) -> Result<Self> {
        if sample.is_empty() {
            return Err(AtomError::Validation(
                "cannot partition an empty sample".to_string(),
            ));
        }
        let dims = sample[0].len();
        if let Some(p) = sample.iter().find(|p| p.len() != dims) {
            return Err(AtomError::DimensionMismatch {
                expected: dims,
                actual: p.len(),
            });
        }

        let mut rng = StdRng::seed_from_u64(params.seed);
        let mut centroids = seed_centroids(sample, params.k.max(1), &mut rng);
        let mut assignment = vec![0usize; sample.len()];
        let mut iterations = 0u32;
        let mut converged = false;

        for _ in 0..params.max_iterations {
            if budget.is_exhausted() {
                return Err(AtomError::Cancelled);
            }
            iterations += 1;

            for (slot, point) in assignment.iter_mut().zip(sample) {
                *slot = nearest(&centroids, point).0;
            }

            let mut sums = vec![vec![0.0; dims]; centroids.len()];
            let mut counts = vec![0usize; centroids.len()];
            for (point, &c) in sample.iter().zip(&assignment) {
                counts[c] += 1;
                for (s, x) in sums[c].iter_mut().zip(point) {
                    *s += x;
                }
            }

            let mut shift: f64 = 0.0;
            for ((centroid, sum), count) in centroids.iter_mut().zip(sums).zip(counts) {
                // An empty cluster keeps its previous centroid.
                if count == 0 {
                    continue;
                }
                let updated: Vec<f64> = sum.into_iter().map(|s| s / count as f64).collect();
                shift = shift.max(squared_distance(centroid, &updated).sqrt());
                *centroid = updated;
            }

            if shift <= params.tolerance {
                converged = true;
                break;
            }
        }

        debug!(
            version,
            centroids = centroids.len(),
            iterations,
            converged,
            "k-means finished"
        );
        Ok(Self {
            version,
            landmark_version,
            centroids,
            iterations,
            converged,
            valid_from: Utc::now(),
        })
    }

    pub fn from_record(record: &PartitionRecord) -> Result<Self> {
        if record.centroids.is_empty() {
            return Err(AtomError::Integrity(format!(
                "partition set {} of {} has no centroids",
                record.version, record.model
            )));
        }
        Ok(Self {
            version: record.version,
            landmark_version: record.landmark_version,
            centroids: record.centroids.clone(),
            iterations: record.iterations,
            converged: record.converged,
            valid_from: record.valid_from,
        })
    }

    pub fn to_record(&self, model: &ModelVersion) -> PartitionRecord {
        PartitionRecord {
            model: model.clone(),
            version: self.version,
            landmark_version: self.landmark_version,
            centroids: self.centroids.clone(),
            iterations: self.iterations,
            converged: self.converged,
            valid_from: self.valid_from,
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn landmark_version(&self) -> u32 {
        self.landmark_version
    }

    pub fn centroids(&self) -> &[Vec<f64>] {
        &self.centroids
    }

    pub fn len(&self) -> usize {
        self.centroids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.centroids.is_empty()
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub fn converged(&self) -> bool {
        self.converged
    }

    /// Nearest centroid id. Ties go to the lowest id.
    pub fn assign(&self, key: &[f64]) -> u32 {
        nearest(&self.centroids, key).0 as u32
    }

    /// Partition ids ordered by centroid distance from `key`, nearest first.
    pub fn ranked(&self, key: &[f64]) -> Vec<(u32, f64)> {
        let mut ranked: Vec<(u32, f64)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(i, c)| (i as u32, squared_distance(c, key).sqrt()))
            .collect();
        ranked.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        ranked
    }

    /// Partitions in [`PartitionSet::ranked`] order, each with the distance
    /// from `key` to its cell.
    ///
    /// Keys are assigned to their nearest centroid, so partition `j` holds
    /// only points on its side of the bisector between `j` and the home
    /// partition. The distance to that bisector bounds how far a ball around
    /// `key` must reach before `j` can contribute. The home partition is
    /// first, at distance zero.
    pub fn reach(&self, key: &[f64]) -> Vec<(u32, f64)> {
        let ranked = self.ranked(key);
        let Some(&(home, home_distance)) = ranked.first() else {
            return ranked;
        };
        let home_centroid = &self.centroids[home as usize];
        ranked
            .into_iter()
            .map(|(id, distance)| {
                let separation = squared_distance(&self.centroids[id as usize], home_centroid).sqrt();
                let boundary = if id == home || separation <= 0.0 {
                    0.0
                } else {
                    ((distance * distance - home_distance * home_distance) / (2.0 * separation)).max(0.0)
                };
                (id, boundary)
            })
            .collect()
    }
}

/// k-means++ seeding: each further centroid is drawn with probability
/// proportional to its squared distance from the closest centroid so far.
fn seed_centroids(sample: &[Vec<f64>], k: usize, rng: &mut StdRng) -> Vec<Vec<f64>> {
    let mut centroids = vec![sample[rng.random_range(0..sample.len())].clone()];
    let mut d2: Vec<f64> = sample
        .iter()
        .map(|p| squared_distance(p, &centroids[0]))
        .collect();

    while centroids.len() < k {
        let total: f64 = d2.iter().sum();
        if !(total > 0.0) {
            // Every remaining point coincides with a centroid.
            break;
        }
        let mut target = rng.random::<f64>() * total;
        let mut chosen = d2.len() - 1;
        for (i, &d) in d2.iter().enumerate() {
            if d <= 0.0 {
                continue;
            }
            if target < d {
                chosen = i;
                break;
            }
            target -= d;
            chosen = i;
        }
        let centroid = sample[chosen].clone();
        for (slot, p) in d2.iter_mut().zip(sample) {
            *slot = slot.min(squared_distance(p, &centroid));
        }
        centroids.push(centroid);
    }
    centroids
}

fn nearest(centroids: &[Vec<f64>], point: &[f64]) -> (usize, f64) {
    let mut best = (0usize, f64::INFINITY);
    for (i, c) in centroids.iter().enumerate() {
        let d = squared_distance(c, point);
        if d < best.1 {
            best = (i, d);
        }
    }
    best
}

fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}
