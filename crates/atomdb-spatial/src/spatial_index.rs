//! Spatial index snapshots.
//!
//! One snapshot per model version: the projector and partition set it was
//! built under, a k-d tree per partition, and an overlay holding keys added
//! after the build and atoms collected since. Readers hold an `Arc` to a
//! snapshot for the whole query, so a rebuild swapping in a new snapshot
//! never changes what an in-flight query sees apart from overlay updates.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard};

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use atomdb_core::budget::{Budget, Interrupt};
use atomdb_core::config::QueryConfig;
use atomdb_core::error::{AtomError, Result};
use atomdb_core::types::{AtomId, ModelVersion, SpatialKey, Timestamp};

use crate::kdtree::{euclidean, BoundingBox, Candidate, KdTree};
use crate::partition::PartitionSet;
use crate::projector::Projector;
use crate::query::Truncation;

/// Absorbs rounding in the bisector distances of [`PartitionSet::reach`].
const REACH_SLACK: f64 = 1e-9;

/// Keys of one partition added after the build.
#[derive(Default)]
struct DeltaBucket {
    entries: Vec<DeltaEntry>,
    /// Covers every entry ever added; not shrunk on removal.
    bbox: Option<BoundingBox>,
}

struct DeltaEntry {
    atom_id: AtomId,
    coords: Vec<f64>,
}

impl DeltaBucket {
    fn push(&mut self, atom_id: AtomId, coords: &[f64]) {
        match self.bbox.as_mut() {
            Some(bbox) => bbox.extend(coords),
            None => {
                self.bbox = Some(BoundingBox {
                    min: coords.to_vec(),
                    max: coords.to_vec(),
                })
            }
        }
        self.entries.push(DeltaEntry {
            atom_id,
            coords: coords.to_vec(),
        });
    }

    fn reaches(&self, center: &[f64], radius: f64) -> bool {
        !self.entries.is_empty()
            && self
                .bbox
                .as_ref()
                .is_some_and(|b| b.min_distance(center) <= radius)
    }
}

/// Changes since the snapshot was built.
#[derive(Default)]
struct Overlay {
    delta: HashMap<u32, DeltaBucket>,
    /// Partition of every delta atom.
    delta_ids: HashMap<AtomId, u32>,
    /// Base atoms collected since the build.
    removed: HashSet<AtomId>,
}

/// Candidate set gathered by the coarse stage of a query.
#[derive(Debug, Clone)]
pub struct CandidateSet {
    /// Candidates ordered by key-space distance, then atom id.
    pub candidates: Vec<Candidate>,
    /// Radius of the last ball searched.
    pub radius: f64,
    pub widen_steps: u32,
    pub truncation: Option<Truncation>,
    /// Partition whose centroid is nearest the query key.
    pub home_partition: Option<u32>,
    /// Partitions whose cells the last ball reached, home first.
    pub partitions_searched: Vec<u32>,
}

pub struct SpatialIndex {
    model: ModelVersion,
    projector: Projector,
    partitions: Arc<PartitionSet>,
    shards: HashMap<u32, KdTree>,
    /// Partition of every base atom.
    base: HashMap<AtomId, u32>,
    overlay: RwLock<Overlay>,
    job_id: Uuid,
    built_at: Timestamp,
}

impl SpatialIndex {
    /// Assemble a snapshot from keys computed under `projector` and
    /// `partitions`.
    ///
    /// Keys carrying other landmark or partition versions are rejected.
    pub fn new(
        model: ModelVersion,
        projector: Projector,
        partitions: Arc<PartitionSet>,
        keys: Vec<(AtomId, SpatialKey)>,
        leaf_size: usize,
        job_id: Uuid,
    ) -> Result<Self> {
        if partitions.landmark_version() != projector.landmark_version() {
            return Err(AtomError::Validation(format!(
                "partition set {} belongs to landmark version {}, not {}",
                partitions.version(),
                partitions.landmark_version(),
                projector.landmark_version()
            )));
        }

        let dims = projector.key_dimension();
        let mut grouped: Vec<Vec<(AtomId, Vec<f64>)>> = vec![Vec::new(); partitions.len()];
        let mut base = HashMap::with_capacity(keys.len());
        for (atom_id, key) in keys {
            check_key(&projector, &partitions, &key)?;
            if base.contains_key(&atom_id) {
                continue;
            }
            base.insert(atom_id, key.partition_id);
            grouped[key.partition_id as usize].push((atom_id, key.coords));
        }

        let shards: HashMap<u32, KdTree> = grouped
            .into_iter()
            .enumerate()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(partition_id, entries)| (partition_id as u32, KdTree::build(dims, entries, leaf_size)))
            .collect();

        debug!(
            model = %model,
            shards = shards.len(),
            atoms = base.len(),
            "Spatial index assembled"
        );
        Ok(Self {
            model,
            projector,
            partitions,
            shards,
            base,
            overlay: RwLock::new(Overlay::default()),
            job_id,
            built_at: Utc::now(),
        })
    }

    pub fn model(&self) -> &ModelVersion {
        &self.model
    }

    pub fn projector(&self) -> &Projector {
        &self.projector
    }

    pub fn partitions(&self) -> &Arc<PartitionSet> {
        &self.partitions
    }

    pub fn landmark_version(&self) -> u32 {
        self.projector.landmark_version()
    }

    pub fn partition_version(&self) -> u32 {
        self.partitions.version()
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn built_at(&self) -> Timestamp {
        self.built_at
    }

    fn overlay(&self) -> Result<RwLockReadGuard<'_, Overlay>> {
        self.overlay
            .read()
            .map_err(|e| AtomError::Storage(format!("Lock poisoned: {}", e)))
    }

    /// Live atoms: base shards minus collected ones, plus the delta.
    pub fn len(&self) -> usize {
        self.overlay()
            .map(|o| self.base.len() - o.removed.len() + o.delta_ids.len())
            .unwrap_or(self.base.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn delta_len(&self) -> usize {
        self.overlay().map(|o| o.delta_ids.len()).unwrap_or(0)
    }

    pub fn contains(&self, atom_id: AtomId) -> bool {
        let Ok(overlay) = self.overlay() else {
            return false;
        };
        (self.base.contains_key(&atom_id) && !overlay.removed.contains(&atom_id))
            || overlay.delta_ids.contains_key(&atom_id)
    }

    /// Live atom count per partition id, base and delta together.
    pub fn partition_sizes(&self) -> HashMap<u32, usize> {
        let mut sizes: HashMap<u32, usize> = self
            .shards
            .iter()
            .map(|(partition_id, tree)| (*partition_id, tree.len()))
            .collect();
        if let Ok(overlay) = self.overlay() {
            for atom_id in &overlay.removed {
                if let Some(size) = self.base.get(atom_id).and_then(|p| sizes.get_mut(p)) {
                    *size -= 1;
                }
            }
            for partition_id in overlay.delta_ids.values() {
                *sizes.entry(*partition_id).or_default() += 1;
            }
        }
        sizes
    }

    /// Key for a vector under this snapshot's landmark and partition versions.
    pub fn project_to_key(&self, vector: &[f32]) -> Result<SpatialKey> {
        self.projector.project_to_key(vector, Some(&self.partitions))
    }

    /// Add a key to the delta buffer. Returns false if the atom is already
    /// indexed or was collected.
    pub fn insert(&self, atom_id: AtomId, key: &SpatialKey) -> Result<bool> {
        check_key(&self.projector, &self.partitions, key)?;
        if self.base.contains_key(&atom_id) {
            return Ok(false);
        }
        let mut overlay = self
            .overlay
            .write()
            .map_err(|e| AtomError::Storage(format!("Lock poisoned: {}", e)))?;
        if overlay.delta_ids.contains_key(&atom_id) {
            return Ok(false);
        }
        overlay.delta_ids.insert(atom_id, key.partition_id);
        overlay
            .delta
            .entry(key.partition_id)
            .or_default()
            .push(atom_id, &key.coords);
        Ok(true)
    }

    /// Drop atoms that no longer exist. Delta entries are removed outright;
    /// base atoms are hidden from searches until the next rebuild. Returns
    /// how many indexed atoms were dropped.
    pub fn remove(&self, atom_ids: &[AtomId]) -> Result<usize> {
        let mut overlay = self
            .overlay
            .write()
            .map_err(|e| AtomError::Storage(format!("Lock poisoned: {}", e)))?;
        let mut removed = 0;
        for atom_id in atom_ids {
            if let Some(partition_id) = overlay.delta_ids.remove(atom_id) {
                if let Some(bucket) = overlay.delta.get_mut(&partition_id) {
                    bucket.entries.retain(|e| e.atom_id != *atom_id);
                }
                removed += 1;
            } else if self.base.contains_key(atom_id) && overlay.removed.insert(*atom_id) {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Coarse stage of a query: gather atoms whose keys lie within a ball
    /// around `center`, widening the ball until enough candidates are found.
    ///
    /// The home partition is searched first; a neighboring partition joins
    /// once the ball reaches its cell, so widening takes in partitions in
    /// the order the ball crosses into them.
    ///
    /// The search stops once it holds `k * candidate_factor` candidates (but
    /// never fewer than `k` nor more than `max_candidates`), once every
    /// indexed atom is inside the ball, or once `max_widen_steps` widenings
    /// have been spent. Running out of steps or hitting the cap is reported
    /// in `truncation`, as is an interrupted budget.
    pub fn candidates(
        &self,
        center: &[f64],
        k: usize,
        config: &QueryConfig,
        initial_radius: Option<f64>,
        budget: &Budget,
    ) -> Result<CandidateSet> {
        if center.len() != self.projector.key_dimension() {
            return Err(AtomError::DimensionMismatch {
                expected: self.projector.key_dimension(),
                actual: center.len(),
            });
        }
        let radius = initial_radius.unwrap_or(config.initial_radius);
        if !(radius.is_finite() && radius > 0.0) {
            return Err(AtomError::Validation(format!(
                "search radius must be positive, got {}",
                radius
            )));
        }

        let total = self.len();
        let cap = config.max_candidates.max(1);
        let target = k
            .saturating_mul(config.candidate_factor.max(1))
            .max(k)
            .min(cap);
        let reach = self.partitions.reach(center);

        let mut radius = radius;
        let mut widen_steps = 0;
        let mut found = Vec::new();
        let mut searched = Vec::new();
        let mut truncation = None;
        loop {
            found.clear();
            searched.clear();
            if let Some(interrupt) = self.collect(center, radius, &reach, budget, &mut found, &mut searched)? {
                truncation = Some(Truncation::from(interrupt));
                break;
            }
            if found.len() >= target || found.len() >= total {
                break;
            }
            if widen_steps >= config.max_widen_steps {
                truncation = Some(Truncation::WidenLimit);
                break;
            }
            radius *= config.widen_factor;
            widen_steps += 1;
        }

        found.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| a.atom_id.cmp(&b.atom_id))
        });
        if found.len() > cap {
            found.truncate(cap);
            truncation = truncation.or(Some(Truncation::CandidateCap));
        }

        Ok(CandidateSet {
            candidates: found,
            radius,
            widen_steps,
            truncation,
            home_partition: reach.first().map(|(id, _)| *id),
            partitions_searched: searched,
        })
    }

    /// Every live atom within `radius` of `center`, partition by partition in
    /// `reach` order. Within a partition the delta bucket is read before the
    /// shard, so an interrupted search still returns recent keys.
    fn collect(
        &self,
        center: &[f64],
        radius: f64,
        reach: &[(u32, f64)],
        budget: &Budget,
        out: &mut Vec<Candidate>,
        searched: &mut Vec<u32>,
    ) -> Result<Option<Interrupt>> {
        let overlay = self.overlay()?;
        let mut interrupt = None;
        for &(partition_id, boundary) in reach {
            if boundary > radius + REACH_SLACK {
                continue;
            }
            searched.push(partition_id);

            if let Some(bucket) = overlay.delta.get(&partition_id).filter(|b| b.reaches(center, radius)) {
                for entry in &bucket.entries {
                    let distance = euclidean(center, &entry.coords);
                    if distance <= radius {
                        out.push(Candidate {
                            atom_id: entry.atom_id,
                            distance,
                        });
                    }
                }
            }

            let Some(tree) = self.shards.get(&partition_id) else {
                continue;
            };
            if tree.bounds().map_or(true, |b| b.min_distance(center) > radius) {
                continue;
            }
            interrupt = tree.within(center, radius, budget, out);
            if interrupt.is_some() {
                break;
            }
        }
        if !overlay.removed.is_empty() {
            out.retain(|c| !overlay.removed.contains(&c.atom_id));
        }
        Ok(interrupt)
    }
}

impl std::fmt::Debug for SpatialIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpatialIndex")
            .field("model", &self.model)
            .field("landmark_version", &self.landmark_version())
            .field("partition_version", &self.partition_version())
            .field("shards", &self.shards.len())
            .field("atoms", &self.len())
            .finish()
    }
}

fn check_key(projector: &Projector, partitions: &PartitionSet, key: &SpatialKey) -> Result<()> {
    if key.landmark_version != projector.landmark_version()
        || key.partition_version != partitions.version()
    {
        return Err(AtomError::Validation(format!(
            "key built under landmarks {} / partitions {}, index uses {} / {}",
            key.landmark_version,
            key.partition_version,
            projector.landmark_version(),
            partitions.version()
        )));
    }
    if key.coords.len() != projector.key_dimension() {
        return Err(AtomError::DimensionMismatch {
            expected: projector.key_dimension(),
            actual: key.coords.len(),
        });
    }
    if key.partition_id as usize >= partitions.len() {
        return Err(AtomError::Integrity(format!(
            "key refers to partition {} but set {} has {}",
            key.partition_id,
            partitions.version(),
            partitions.len()
        )));
    }
    Ok(())
}

/// Current snapshot per model version.
#[derive(Debug, Default)]
pub struct IndexRegistry {
    indexes: RwLock<HashMap<ModelVersion, Arc<SpatialIndex>>>,
}

impl IndexRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, model: &ModelVersion) -> Option<Arc<SpatialIndex>> {
        self.indexes.read().ok()?.get(model).cloned()
    }

    /// Install a snapshot, returning the one it replaced. Queries already
    /// holding the old snapshot keep using it.
    pub fn swap(&self, index: SpatialIndex) -> Result<Option<Arc<SpatialIndex>>> {
        let index = Arc::new(index);
        let mut indexes = self
            .indexes
            .write()
            .map_err(|e| AtomError::Storage(format!("Lock poisoned: {}", e)))?;
        info!(
            model = %index.model(),
            landmark_version = index.landmark_version(),
            partition_version = index.partition_version(),
            atoms = index.len(),
            "Spatial index swapped in"
        );
        Ok(indexes.insert(index.model().clone(), index))
    }

    pub fn remove(&self, model: &ModelVersion) -> Option<Arc<SpatialIndex>> {
        self.indexes.write().ok()?.remove(model)
    }

    pub fn models(&self) -> Vec<ModelVersion> {
        let mut models: Vec<ModelVersion> = self
            .indexes
            .read()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        models.sort();
        models
    }
}
