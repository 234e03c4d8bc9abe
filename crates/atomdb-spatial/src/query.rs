//! k-nearest-neighbor queries.
//!
//! A query runs in two stages. Stage A gathers candidates from the spatial
//! index by widening a ball around the query's spatial key. Stage B scores
//! every candidate with exact cosine similarity against the stored
//! full-precision vector and keeps the best `k`. Without an index for the
//! model the engine falls back to an exact linear scan and marks the result
//! as degraded.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use atomdb_core::budget::{Budget, Interrupt};
use atomdb_core::config::QueryConfig;
use atomdb_core::error::{AtomError, Result};
use atomdb_core::types::{ModelVersion, Neighbor};

use crate::spatial_index::{IndexRegistry, SpatialIndex};
use crate::vectors::{cosine_similarity, rank, validate_vector, ModelVectors, VectorStore, CHECK_EVERY};

/// A k-nearest-neighbor request.
#[derive(Debug, Clone)]
pub struct KnnQuery {
    pub vector: Vec<f32>,
    pub k: usize,
    pub model: ModelVersion,
    /// Starting Stage A radius; the configured default when `None`.
    pub radius: Option<f64>,
    pub budget: Budget,
}

impl KnnQuery {
    pub fn new(vector: Vec<f32>, k: usize, model: impl Into<ModelVersion>) -> Self {
        Self {
            vector,
            k,
            model: model.into(),
            radius: None,
            budget: Budget::unlimited(),
        }
    }

    pub fn with_radius(mut self, radius: f64) -> Self {
        self.radius = Some(radius);
        self
    }

    pub fn with_budget(mut self, budget: Budget) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.budget = self.budget.with_timeout(timeout);
        self
    }
}

/// Where a result's neighbors came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    /// Two-stage search over the spatial index.
    Index,
    /// Exact scan over every vector of the model.
    LinearScan,
}

/// Why a result may be missing true neighbors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Truncation {
    /// Stage A found more candidates than it may hand on and kept the closest.
    CandidateCap,
    /// Stage A ran out of widening steps before reaching its target.
    WidenLimit,
    Cancelled,
    DeadlineExceeded,
}

impl From<Interrupt> for Truncation {
    fn from(interrupt: Interrupt) -> Self {
        match interrupt {
            Interrupt::Cancelled => Truncation::Cancelled,
            Interrupt::DeadlineExceeded => Truncation::DeadlineExceeded,
        }
    }
}

/// Query result envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnnResult {
    /// At most `k` neighbors, by descending similarity then ascending id.
    pub neighbors: Vec<Neighbor>,
    pub source: ResultSource,
    pub truncation: Option<Truncation>,
    pub landmark_version: Option<u32>,
    pub partition_version: Option<u32>,
    /// Vectors scored in Stage B (or by the scan).
    pub candidates: usize,
    /// Final Stage A radius.
    pub radius: Option<f64>,
    pub widen_steps: u32,
    /// Partition the query key falls in.
    pub home_partition: Option<u32>,
    /// Partitions reached by the final Stage A ball, home first.
    pub partitions_searched: Vec<u32>,
    pub degraded_reason: Option<String>,
}

impl KnnResult {
    /// Served by the linear-scan fallback instead of the index.
    pub fn is_degraded(&self) -> bool {
        self.source == ResultSource::LinearScan
    }

    /// Cut short by a cap, the widening limit or the budget.
    pub fn is_partial(&self) -> bool {
        self.truncation.is_some()
    }
}

/// Runs queries against the current index snapshot of each model.
pub struct QueryEngine {
    indexes: Arc<IndexRegistry>,
    vectors: Arc<VectorStore>,
    config: QueryConfig,
}

impl QueryEngine {
    pub fn new(indexes: Arc<IndexRegistry>, vectors: Arc<VectorStore>, config: QueryConfig) -> Self {
        Self {
            indexes,
            vectors,
            config,
        }
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// Top-k neighbors of `query.vector` among the model's vectors.
    pub fn k_nearest(&self, query: &KnnQuery) -> Result<KnnResult> {
        let table = self.prepare(query)?;
        match self.indexes.get(&query.model) {
            Some(index) => self.search(&index, &table, query),
            None => {
                let reason = format!("no spatial index built for model {}", query.model);
                warn!(model = %query.model, "Falling back to linear scan: {}", reason);
                self.linear_scan(&table, query, reason)
            }
        }
    }

    /// Run a query against a snapshot the caller already holds, regardless of
    /// what is currently installed.
    pub fn k_nearest_in(&self, index: &Arc<SpatialIndex>, query: &KnnQuery) -> Result<KnnResult> {
        if index.model() != &query.model {
            return Err(AtomError::Validation(format!(
                "index belongs to model {}, query names {}",
                index.model(),
                query.model
            )));
        }
        let table = self.prepare(query)?;
        self.search(index, &table, query)
    }

    fn prepare(&self, query: &KnnQuery) -> Result<Arc<ModelVectors>> {
        if query.k == 0 {
            return Err(AtomError::Validation("k must be at least 1".to_string()));
        }
        validate_vector(&query.vector)?;
        query.model.validate()?;
        let table = self
            .vectors
            .model(&query.model)
            .ok_or_else(|| AtomError::NotFound(format!("no vectors stored for model {}", query.model)))?;
        if table.dimension() != query.vector.len() {
            return Err(AtomError::DimensionMismatch {
                expected: table.dimension(),
                actual: query.vector.len(),
            });
        }
        Ok(table)
    }

    fn search(&self, index: &Arc<SpatialIndex>, table: &ModelVectors, query: &KnnQuery) -> Result<KnnResult> {
        let center = index.projector().project(&query.vector)?;
        let stage_a = index.candidates(&center, query.k, &self.config, query.radius, &query.budget)?;

        // An interrupted Stage A hands on a bounded partial set; it is
        // scored in full. Otherwise the budget is polled between blocks.
        let interrupted = matches!(
            stage_a.truncation,
            Some(Truncation::Cancelled | Truncation::DeadlineExceeded)
        );
        let mut truncation = stage_a.truncation;
        let mut scored = Vec::with_capacity(stage_a.candidates.len());
        for (i, candidate) in stage_a.candidates.iter().enumerate() {
            if !interrupted && i > 0 && i % CHECK_EVERY == 0 {
                if let Some(interrupt) = query.budget.check() {
                    truncation = Some(Truncation::from(interrupt));
                    break;
                }
            }
            // Collected since the snapshot was taken.
            let Some(vector) = table.get(candidate.atom_id) else {
                continue;
            };
            scored.push(Neighbor {
                atom_id: candidate.atom_id,
                score: cosine_similarity(&query.vector, &vector),
            });
        }

        debug!(
            model = %query.model,
            k = query.k,
            candidates = stage_a.candidates.len(),
            scored = scored.len(),
            radius = stage_a.radius,
            widen_steps = stage_a.widen_steps,
            home_partition = ?stage_a.home_partition,
            partitions_searched = stage_a.partitions_searched.len(),
            truncation = ?truncation,
            "Two-stage query finished"
        );
        Ok(KnnResult {
            candidates: scored.len(),
            neighbors: rank(scored, query.k),
            source: ResultSource::Index,
            truncation,
            landmark_version: Some(index.landmark_version()),
            partition_version: Some(index.partition_version()),
            radius: Some(stage_a.radius),
            widen_steps: stage_a.widen_steps,
            home_partition: stage_a.home_partition,
            partitions_searched: stage_a.partitions_searched,
            degraded_reason: None,
        })
    }

    fn linear_scan(&self, table: &ModelVectors, query: &KnnQuery, reason: String) -> Result<KnnResult> {
        let (neighbors, interrupt) = table.scan(&query.vector, query.k, &query.budget)?;
        Ok(KnnResult {
            neighbors,
            source: ResultSource::LinearScan,
            truncation: interrupt.map(Truncation::from),
            landmark_version: None,
            partition_version: None,
            candidates: table.len(),
            radius: None,
            widen_steps: 0,
            home_partition: None,
            partitions_searched: Vec::new(),
            degraded_reason: Some(reason),
        })
    }
}
