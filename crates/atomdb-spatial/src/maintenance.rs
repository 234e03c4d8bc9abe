//! Index maintenance: rebuilds, startup restore and the background key
//! worker.
//!
//! A rebuild projects every vector of a model under the latest landmark
//! set, clusters a sample of the keys, persists the new partition set with
//! its keys in one transaction and swaps the new snapshot in. Vectors that
//! arrive while it runs are caught up into the new snapshot's delta buffer
//! after the swap.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use atomdb_core::budget::Budget;
use atomdb_core::config::AtomConfig;
use atomdb_core::error::{AtomError, Result};
use atomdb_core::types::{AtomId, ModelVersion, SpatialKey};
use atomdb_storage::{PartitionRecord, PartitionRepository, SpatialKeyRepository};

use crate::landmark::{LandmarkRegistry, LandmarkSet};
use crate::partition::{KMeansParams, PartitionSet};
use crate::projector::Projector;
use crate::spatial_index::{IndexRegistry, SpatialIndex};
use crate::vectors::{ModelVectors, VectorStore, CHECK_EVERY};

/// Summary of a finished rebuild.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebuildReport {
    pub job_id: Uuid,
    pub model: ModelVersion,
    pub landmark_version: u32,
    pub partition_version: u32,
    pub partitions: usize,
    pub atoms: usize,
    pub iterations: u32,
    pub converged: bool,
    /// Vectors added to the new snapshot after it was swapped in.
    pub caught_up: usize,
    pub elapsed_ms: u64,
}

/// A snapshot together with what must be persisted for it.
pub struct BuiltIndex {
    pub index: SpatialIndex,
    pub record: PartitionRecord,
    pub keys: Vec<(AtomId, SpatialKey)>,
}

/// Project, cluster and lay out `entries` into a fresh snapshot. Nothing is
/// persisted or installed.
pub fn build_index(
    model: &ModelVersion,
    landmarks: Arc<LandmarkSet>,
    entries: &[(AtomId, Arc<[f32]>)],
    partition_version: u32,
    config: &AtomConfig,
    job_id: Uuid,
    budget: &Budget,
) -> Result<BuiltIndex> {
    if entries.is_empty() {
        return Err(AtomError::NotFound(format!("no vectors stored for model {}", model)));
    }
    let projector = Projector::from_config(landmarks, &config.projection)?;

    let mut coords = Vec::with_capacity(entries.len());
    for (i, (_, vector)) in entries.iter().enumerate() {
        if i % CHECK_EVERY == 0 && budget.is_exhausted() {
            return Err(AtomError::Cancelled);
        }
        coords.push(projector.project(vector)?);
    }

    let sample_size = config.partition.sample_size.max(1);
    let sample: Vec<Vec<f64>> = if coords.len() > sample_size {
        let mut rng = StdRng::seed_from_u64(config.partition.seed);
        let mut picked = rand::seq::index::sample(&mut rng, coords.len(), sample_size).into_vec();
        picked.sort_unstable();
        picked.into_iter().map(|i| coords[i].clone()).collect()
    } else {
        coords.clone()
    };

    let params = KMeansParams::for_corpus(entries.len(), &config.partition);
    let partitions = PartitionSet::build(
        partition_version,
        projector.landmark_version(),
        &sample,
        params,
        budget,
    )?;

    let mut keys = Vec::with_capacity(entries.len());
    for ((atom_id, _), c) in entries.iter().zip(coords) {
        keys.push((*atom_id, projector.key_for(c, Some(&partitions))?));
    }
    keys.sort_by(|(a_id, a), (b_id, b)| {
        (a.partition_id, a.locality, a_id).cmp(&(b.partition_id, b.locality, b_id))
    });

    let record = partitions.to_record(model);
    let index = SpatialIndex::new(
        model.clone(),
        projector,
        Arc::new(partitions),
        keys.clone(),
        config.query.leaf_size,
        job_id,
    )?;
    Ok(BuiltIndex { index, record, keys })
}

/// Owns the write side of the spatial indexes.
pub struct IndexMaintainer {
    config: AtomConfig,
    landmarks: Arc<LandmarkRegistry>,
    vectors: Arc<VectorStore>,
    indexes: Arc<IndexRegistry>,
    partitions: PartitionRepository,
    keys: SpatialKeyRepository,
    rebuild_lock: Mutex<()>,
}

impl IndexMaintainer {
    pub fn new(
        config: AtomConfig,
        landmarks: Arc<LandmarkRegistry>,
        vectors: Arc<VectorStore>,
        indexes: Arc<IndexRegistry>,
        partitions: PartitionRepository,
        keys: SpatialKeyRepository,
    ) -> Self {
        Self {
            config,
            landmarks,
            vectors,
            indexes,
            partitions,
            keys,
            rebuild_lock: Mutex::new(()),
        }
    }

    /// Rebuild the index of `model` under the latest landmark set.
    ///
    /// On cancellation nothing is persisted and the current snapshot stays
    /// installed. Rebuilds of the same engine run one at a time.
    pub fn rebuild(&self, model: &ModelVersion, budget: &Budget) -> Result<RebuildReport> {
        let _guard = self
            .rebuild_lock
            .lock()
            .map_err(|e| AtomError::Storage(format!("Lock poisoned: {}", e)))?;
        let started = Instant::now();

        let landmarks = self
            .landmarks
            .latest()
            .ok_or_else(|| AtomError::Validation("no landmark set has been published".to_string()))?;
        let table = self
            .vectors
            .model(model)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AtomError::NotFound(format!("no vectors stored for model {}", model)))?;
        if table.dimension() != landmarks.dimension() {
            return Err(AtomError::DimensionMismatch {
                expected: landmarks.dimension(),
                actual: table.dimension(),
            });
        }

        let entries = table.snapshot()?;
        let version = self.partitions.next_version(model)?;
        let job_id = Uuid::new_v4();
        info!(%job_id, model = %model, atoms = entries.len(), partition_version = version, "Index rebuild started");

        let built = build_index(model, landmarks, &entries, version, &self.config, job_id, budget)?;
        if budget.is_exhausted() {
            return Err(AtomError::Cancelled);
        }
        self.partitions.publish(&built.record, &built.keys)?;

        let mut report = RebuildReport {
            job_id,
            model: model.clone(),
            landmark_version: built.index.landmark_version(),
            partition_version: version,
            partitions: built.record.centroids.len(),
            atoms: built.keys.len(),
            iterations: built.record.iterations,
            converged: built.record.converged,
            caught_up: 0,
            elapsed_ms: 0,
        };
        self.indexes.swap(built.index)?;
        let index = self
            .indexes
            .get(model)
            .ok_or_else(|| AtomError::IndexUnavailable(format!("index for {} vanished after swap", model)))?;
        report.caught_up = self.catch_up(&index, &table)?;
        // Atoms collected while the build ran.
        let stale: Vec<AtomId> = built
            .keys
            .iter()
            .map(|(atom_id, _)| *atom_id)
            .filter(|atom_id| !table.contains(*atom_id))
            .collect();
        if !stale.is_empty() {
            let dropped = index.remove(&stale)?;
            debug!(%job_id, model = %model, dropped, "Collected atoms dropped from new snapshot");
        }
        report.elapsed_ms = started.elapsed().as_millis() as u64;

        info!(
            %job_id,
            model = %model,
            partitions = report.partitions,
            atoms = report.atoms,
            caught_up = report.caught_up,
            elapsed_ms = report.elapsed_ms,
            "Index rebuild finished"
        );
        Ok(report)
    }

    /// Key every vector of `table` that `index` does not hold yet.
    fn catch_up(&self, index: &SpatialIndex, table: &ModelVectors) -> Result<usize> {
        let mut added = 0;
        for (atom_id, vector) in table.snapshot()? {
            if index.contains(atom_id) {
                continue;
            }
            if self.add_key(index, atom_id, &vector)? {
                added += 1;
            }
        }
        Ok(added)
    }

    fn add_key(&self, index: &SpatialIndex, atom_id: AtomId, vector: &[f32]) -> Result<bool> {
        let key = index.project_to_key(vector)?;
        self.keys.upsert(atom_id, index.model(), &key)?;
        index.insert(atom_id, &key)
    }

    /// Compute and record the spatial key of one atom under the current
    /// snapshot. Idempotent: returns `false` when there is nothing to do
    /// (no snapshot, vector gone, or already indexed).
    pub fn index_atom(&self, model: &ModelVersion, atom_id: AtomId) -> Result<bool> {
        let Some(index) = self.indexes.get(model) else {
            return Ok(false);
        };
        if index.contains(atom_id) {
            return Ok(false);
        }
        let Some(vector) = self.vectors.model(model).and_then(|t| t.get(atom_id)) else {
            return Ok(false);
        };
        let added = self.add_key(&index, atom_id, &vector)?;
        if added {
            debug!(atom_id = %atom_id, model = %model, "Spatial key added");
        }
        Ok(added)
    }

    /// Rebuild `model` if its delta buffer has outgrown
    /// `maintenance.max_delta`. Returns the report of the rebuild, if one ran.
    pub fn compact_if_needed(&self, model: &ModelVersion) -> Result<Option<RebuildReport>> {
        let limit = self.config.maintenance.max_delta;
        if limit == 0 {
            return Ok(None);
        }
        let delta = self.indexes.get(model).map_or(0, |index| index.delta_len());
        if delta <= limit {
            return Ok(None);
        }
        info!(model = %model, delta, limit, "Delta buffer over limit; rebuilding index");
        self.rebuild(model, &Budget::unlimited()).map(Some)
    }

    /// Reinstall the last published snapshot of `model` from persisted keys.
    ///
    /// Keys missing for the published partition version are recomputed into
    /// the delta buffer. Returns the snapshot size, or `None` when the model
    /// has never been indexed or its landmark set is unknown.
    pub fn restore(&self, model: &ModelVersion) -> Result<Option<usize>> {
        let Some(record) = self.partitions.latest(model)? else {
            return Ok(None);
        };
        let Some(landmarks) = self.landmarks.get(record.landmark_version) else {
            warn!(
                model = %model,
                landmark_version = record.landmark_version,
                "Partition set refers to an unknown landmark version; index not restored"
            );
            return Ok(None);
        };
        let Some(table) = self.vectors.model(model) else {
            return Ok(None);
        };

        let keys: Vec<(AtomId, SpatialKey)> = self
            .keys
            .load(model, record.landmark_version)?
            .into_iter()
            .filter(|(id, key)| key.partition_version == record.version && table.contains(*id))
            .collect();
        let projector = Projector::from_config(landmarks, &self.config.projection)?;
        let partitions = Arc::new(PartitionSet::from_record(&record)?);
        let index = SpatialIndex::new(
            model.clone(),
            projector,
            partitions,
            keys,
            self.config.query.leaf_size,
            Uuid::new_v4(),
        )?;
        self.indexes.swap(index)?;

        let index = self
            .indexes
            .get(model)
            .ok_or_else(|| AtomError::IndexUnavailable(format!("index for {} vanished after swap", model)))?;
        let caught_up = self.catch_up(&index, &table)?;
        info!(
            model = %model,
            partition_version = record.version,
            atoms = index.len(),
            caught_up,
            "Index restored"
        );
        Ok(Some(index.len()))
    }

    /// Async wrapper running the rebuild on the blocking pool.
    pub async fn rebuild_async(
        self: &Arc<Self>,
        model: ModelVersion,
        budget: Budget,
    ) -> Result<RebuildReport> {
        let maintainer = Arc::clone(self);
        tokio::task::spawn_blocking(move || maintainer.rebuild(&model, &budget))
            .await
            .map_err(|e| AtomError::Storage(format!("rebuild task failed: {}", e)))?
    }
}

// =============================================================================
// Background key worker
// =============================================================================

/// Request to compute the spatial key of one atom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyJob {
    pub atom_id: AtomId,
    pub model: ModelVersion,
}

/// Sending side of the key worker.
#[derive(Debug, Clone)]
pub struct KeyQueue {
    tx: mpsc::UnboundedSender<KeyJob>,
    pending: Arc<AtomicUsize>,
}

impl KeyQueue {
    pub fn enqueue(&self, job: KeyJob) -> Result<()> {
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.tx.send(job).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            AtomError::Storage("key worker has stopped".to_string())
        })
    }

    /// Jobs queued or in progress.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Wait until every queued job has been processed.
    pub async fn drain(&self) {
        while self.pending() > 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
}

/// Start the worker on the current tokio runtime.
///
/// Jobs run on the blocking pool one at a time. A failed job is logged and
/// dropped; the next rebuild or restore picks the atom up again. After each
/// job the model's index is rebuilt if its delta buffer is over the limit.
pub fn spawn_key_worker(maintainer: Arc<IndexMaintainer>) -> (KeyQueue, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<KeyJob>();
    let pending = Arc::new(AtomicUsize::new(0));
    let queue = KeyQueue {
        tx,
        pending: Arc::clone(&pending),
    };

    let handle = tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            let maintainer = Arc::clone(&maintainer);
            let atom_id = job.atom_id;
            let result = tokio::task::spawn_blocking(move || {
                let added = maintainer.index_atom(&job.model, job.atom_id)?;
                if added {
                    maintainer.compact_if_needed(&job.model)?;
                }
                Ok::<_, AtomError>(added)
            })
            .await;
            match result {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(atom_id = %atom_id, "Spatial key job failed: {}", e),
                Err(e) => warn!(atom_id = %atom_id, "Spatial key task panicked: {}", e),
            }
            pending.fetch_sub(1, Ordering::SeqCst);
        }
        debug!("Key worker stopped");
    });
    (queue, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use atomdb_core::budget::CancelFlag;
    use atomdb_core::types::Modality;
    use atomdb_storage::{Database, EmbeddingRepository, FingerprintStore, LandmarkRepository};

    struct Fixture {
        store: FingerprintStore,
        embeddings: EmbeddingRepository,
        vectors: Arc<VectorStore>,
        indexes: Arc<IndexRegistry>,
        maintainer: Arc<IndexMaintainer>,
        db: Arc<Database>,
    }

    fn fixture(db: Arc<Database>, landmarks: Arc<LandmarkRegistry>) -> Fixture {
        fixture_with(AtomConfig::default(), db, landmarks)
    }

    fn fixture_with(config: AtomConfig, db: Arc<Database>, landmarks: Arc<LandmarkRegistry>) -> Fixture {
        if let Some(set) = landmarks.latest() {
            let repo = LandmarkRepository::new(Arc::clone(&db));
            let persisted = repo.load_all().unwrap();
            if !persisted.iter().any(|r| r.version == set.version()) {
                repo.append(&set.to_record()).unwrap();
            }
        }
        let vectors = Arc::new(VectorStore::new());
        let indexes = Arc::new(IndexRegistry::new());
        let maintainer = Arc::new(IndexMaintainer::new(
            config,
            landmarks,
            Arc::clone(&vectors),
            Arc::clone(&indexes),
            PartitionRepository::new(Arc::clone(&db)),
            SpatialKeyRepository::new(Arc::clone(&db)),
        ));
        Fixture {
            store: FingerprintStore::new(Arc::clone(&db), &Default::default()),
            embeddings: EmbeddingRepository::new(Arc::clone(&db)),
            vectors,
            indexes,
            maintainer,
            db,
        }
    }

    fn landmarks() -> Arc<LandmarkRegistry> {
        let registry = Arc::new(LandmarkRegistry::new());
        registry
            .publish(LandmarkSet::generate(1, 8, 4, 21).unwrap())
            .unwrap();
        registry
    }

    fn vector(i: usize) -> Vec<f32> {
        (0..8).map(|d| ((i * 13 + d * 7) as f32 * 0.17).sin()).collect()
    }

    fn add(f: &Fixture, i: usize) -> AtomId {
        let atom = f
            .store
            .put("t", format!("atom-{}", i).as_bytes(), Modality::Text)
            .unwrap();
        f.embeddings.save(atom.id, &model(), &vector(i)).unwrap();
        f.vectors.insert(&model(), atom.id, vector(i).into()).unwrap();
        atom.id
    }

    fn model() -> ModelVersion {
        ModelVersion::new("m")
    }

    #[test]
    fn test_rebuild_installs_and_persists() {
        let f = fixture(Arc::new(Database::in_memory().unwrap()), landmarks());
        for i in 0..64 {
            add(&f, i);
        }
        let report = f.maintainer.rebuild(&model(), &Budget::unlimited()).unwrap();
        assert_eq!(report.atoms, 64);
        assert_eq!(report.partition_version, 1);
        assert_eq!(report.partitions, 8);
        assert_eq!(report.caught_up, 0);

        let index = f.indexes.get(&model()).unwrap();
        assert_eq!(index.len(), 64);
        let keys = SpatialKeyRepository::new(Arc::clone(&f.db));
        assert_eq!(keys.count(&model()).unwrap(), 64);

        let second = f.maintainer.rebuild(&model(), &Budget::unlimited()).unwrap();
        assert_eq!(second.partition_version, 2);
        assert_eq!(keys.count(&model()).unwrap(), 64);
    }

    #[test]
    fn test_rebuild_preconditions() {
        let f = fixture(Arc::new(Database::in_memory().unwrap()), Arc::new(LandmarkRegistry::new()));
        add(&f, 1);
        let err = f.maintainer.rebuild(&model(), &Budget::unlimited()).unwrap_err();
        assert!(matches!(err, AtomError::Validation(_)));

        let f = fixture(Arc::new(Database::in_memory().unwrap()), landmarks());
        let err = f.maintainer.rebuild(&model(), &Budget::unlimited()).unwrap_err();
        assert!(matches!(err, AtomError::NotFound(_)));
    }

    #[test]
    fn test_cancelled_rebuild_leaves_state_untouched() {
        let f = fixture(Arc::new(Database::in_memory().unwrap()), landmarks());
        for i in 0..32 {
            add(&f, i);
        }
        let flag = CancelFlag::new();
        flag.cancel();
        let err = f
            .maintainer
            .rebuild(&model(), &Budget::unlimited().with_cancel(flag))
            .unwrap_err();
        assert!(matches!(err, AtomError::Cancelled));
        assert!(f.indexes.get(&model()).is_none());
        let partitions = PartitionRepository::new(Arc::clone(&f.db));
        assert!(partitions.latest(&model()).unwrap().is_none());
    }

    #[test]
    fn test_index_atom_is_idempotent() {
        let f = fixture(Arc::new(Database::in_memory().unwrap()), landmarks());
        for i in 0..16 {
            add(&f, i);
        }
        let before = add(&f, 99);
        assert!(!f.maintainer.index_atom(&model(), before).unwrap());

        f.maintainer.rebuild(&model(), &Budget::unlimited()).unwrap();
        let late = add(&f, 100);
        assert!(f.maintainer.index_atom(&model(), late).unwrap());
        assert!(!f.maintainer.index_atom(&model(), late).unwrap());
        assert_eq!(f.indexes.get(&model()).unwrap().delta_len(), 1);
    }

    #[test]
    fn test_restore_from_persisted_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("atoms.db");
        let registry = landmarks();
        {
            let f = fixture(Arc::new(Database::new(&path).unwrap()), Arc::clone(&registry));
            for i in 0..40 {
                add(&f, i);
            }
            f.maintainer.rebuild(&model(), &Budget::unlimited()).unwrap();
            add(&f, 500);
        }

        let f = fixture(Arc::new(Database::new(&path).unwrap()), registry);
        for (id, v) in f.embeddings.load_model(&model()).unwrap() {
            f.vectors.insert(&model(), id, v.into()).unwrap();
        }
        assert_eq!(f.maintainer.restore(&model()).unwrap(), Some(41));
        let index = f.indexes.get(&model()).unwrap();
        assert_eq!(index.partition_version(), 1);
        assert_eq!(index.delta_len(), 1);

        assert_eq!(f.maintainer.restore(&ModelVersion::new("unknown")).unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_key_worker_processes_queue() {
        let f = fixture(Arc::new(Database::in_memory().unwrap()), landmarks());
        for i in 0..16 {
            add(&f, i);
        }
        f.maintainer
            .rebuild_async(model(), Budget::unlimited())
            .await
            .unwrap();

        let (queue, _handle) = spawn_key_worker(Arc::clone(&f.maintainer));
        let fresh: Vec<AtomId> = (100..110).map(|i| add(&f, i)).collect();
        for &atom_id in &fresh {
            queue.enqueue(KeyJob { atom_id, model: model() }).unwrap();
            queue.enqueue(KeyJob { atom_id, model: model() }).unwrap();
        }
        queue.drain().await;
        assert_eq!(queue.pending(), 0);

        let index = f.indexes.get(&model()).unwrap();
        assert_eq!(index.delta_len(), 10);
        assert!(fresh.iter().all(|id| index.contains(*id)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_key_worker_rebuilds_oversized_delta() {
        let mut config = AtomConfig::default();
        config.maintenance.max_delta = 4;
        let f = fixture_with(config, Arc::new(Database::in_memory().unwrap()), landmarks());
        for i in 0..16 {
            add(&f, i);
        }
        f.maintainer.rebuild(&model(), &Budget::unlimited()).unwrap();
        assert!(f.maintainer.compact_if_needed(&model()).unwrap().is_none());

        let (queue, _handle) = spawn_key_worker(Arc::clone(&f.maintainer));
        let fresh: Vec<AtomId> = (100..110).map(|i| add(&f, i)).collect();
        for &atom_id in &fresh {
            queue.enqueue(KeyJob { atom_id, model: model() }).unwrap();
        }
        queue.drain().await;

        // The fifth delta key triggers one rebuild that takes in all ten.
        let index = f.indexes.get(&model()).unwrap();
        assert_eq!(index.partition_version(), 2);
        assert_eq!(index.delta_len(), 0);
        assert_eq!(index.len(), 26);
        assert!(fresh.iter().all(|id| index.contains(*id)));
    }
}
