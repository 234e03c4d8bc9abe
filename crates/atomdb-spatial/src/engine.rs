//! The atomdb engine facade.
//!
//! `AtomEngine` wires the fingerprint store, the vector cache, landmark and
//! index registries, the query engine and maintenance together behind the
//! producer, consumer and administrative operations. It is the only type
//! outside callers need.

use std::sync::{Arc, Mutex, OnceLock};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use atomdb_core::budget::Budget;
use atomdb_core::config::AtomConfig;
use atomdb_core::error::{AtomError, Result};
use atomdb_core::events::AtomEvent;
use atomdb_core::types::{Atom, AtomId, AtomRef, Modality, ModelVersion};
use atomdb_storage::{
    Database, EmbeddingRepository, FingerprintStore, GarbageCollector, LandmarkRepository,
    PartitionRepository, SpatialKeyRepository, SweepReport,
};

use crate::embedding::DynEmbeddingService;
use crate::ingest::{BatchItem, BatchOutcome, BulkIngest};
use crate::landmark::{LandmarkRegistry, LandmarkSet};
use crate::maintenance::{spawn_key_worker, IndexMaintainer, KeyJob, KeyQueue, RebuildReport};
use crate::projector::Projector;
use crate::query::{KnnQuery, KnnResult, QueryEngine};
use crate::spatial_index::{IndexRegistry, SpatialIndex};
use crate::vectors::{validate_vector, VectorStore};

const EVENT_CAPACITY: usize = 1024;
const DB_FILE: &str = "atomdb.db";

/// Where a new landmark set comes from.
#[derive(Debug, Clone)]
pub enum LandmarkSource {
    /// Explicit landmark vectors, normalized on publish.
    Vectors(Vec<Vec<f64>>),
    /// Seeded random orthonormal directions.
    Random { dimension: usize },
    /// Top principal directions of a model's stored vectors.
    Sample { model: ModelVersion },
}

/// Per-model counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelStats {
    pub model: ModelVersion,
    pub dimension: usize,
    pub vectors: usize,
    pub indexed: usize,
    pub delta: usize,
    pub partitions: usize,
    pub landmark_version: Option<u32>,
    pub partition_version: Option<u32>,
}

/// Engine-wide counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub atoms: u64,
    pub live: u64,
    pub awaiting_sweep: u64,
    pub overflow: u64,
    pub blobs: u64,
    pub total_bytes: u64,
    pub landmark_versions: Vec<u32>,
    pub pending_keys: usize,
    pub models: Vec<ModelStats>,
}

pub struct AtomEngine {
    config: AtomConfig,
    db: Arc<Database>,
    store: FingerprintStore,
    embeddings: EmbeddingRepository,
    landmark_repo: LandmarkRepository,
    landmarks: Arc<LandmarkRegistry>,
    vectors: Arc<VectorStore>,
    indexes: Arc<IndexRegistry>,
    queries: QueryEngine,
    maintainer: Arc<IndexMaintainer>,
    gc: GarbageCollector,
    embedder: Option<Arc<dyn DynEmbeddingService>>,
    key_queue: OnceLock<KeyQueue>,
    publish_lock: Mutex<()>,
    event_tx: broadcast::Sender<AtomEvent>,
}

impl AtomEngine {
    /// Open the engine over the database in `general.data_dir`.
    pub fn open(config: AtomConfig) -> Result<Self> {
        config.validate()?;
        let data_dir = config.general.resolved_data_dir();
        std::fs::create_dir_all(&data_dir)?;
        let db = Database::new(&data_dir.join(DB_FILE))?;
        Self::with_database(config, Arc::new(db))
    }

    /// Engine over a fresh in-memory database.
    pub fn in_memory(config: AtomConfig) -> Result<Self> {
        config.validate()?;
        Self::with_database(config, Arc::new(Database::in_memory()?))
    }

    /// Engine over an already opened database. Persisted landmark sets,
    /// vectors and index snapshots are loaded before it returns.
    pub fn with_database(config: AtomConfig, db: Arc<Database>) -> Result<Self> {
        let landmarks = Arc::new(LandmarkRegistry::new());
        let vectors = Arc::new(VectorStore::new());
        let indexes = Arc::new(IndexRegistry::new());
        let maintainer = Arc::new(IndexMaintainer::new(
            config.clone(),
            Arc::clone(&landmarks),
            Arc::clone(&vectors),
            Arc::clone(&indexes),
            PartitionRepository::new(Arc::clone(&db)),
            SpatialKeyRepository::new(Arc::clone(&db)),
        ));
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let engine = Self {
            store: FingerprintStore::new(Arc::clone(&db), &config.store),
            embeddings: EmbeddingRepository::new(Arc::clone(&db)),
            landmark_repo: LandmarkRepository::new(Arc::clone(&db)),
            queries: QueryEngine::new(Arc::clone(&indexes), Arc::clone(&vectors), config.query.clone()),
            gc: GarbageCollector::new(
                Arc::clone(&db),
                config.store.retention_secs,
                config.maintenance.gc_batch_size,
            ),
            landmarks,
            vectors,
            indexes,
            maintainer,
            embedder: None,
            key_queue: OnceLock::new(),
            publish_lock: Mutex::new(()),
            event_tx,
            config,
            db,
        };
        engine.load()?;
        Ok(engine)
    }

    fn load(&self) -> Result<()> {
        for record in self.landmark_repo.load_all()? {
            self.landmarks.publish(LandmarkSet::from_record(&record)?)?;
        }
        let summaries = self.embeddings.models()?;
        for summary in &summaries {
            for (atom_id, vector) in self.embeddings.load_model(&summary.model)? {
                self.vectors.insert(&summary.model, atom_id, vector.into())?;
            }
            self.maintainer.restore(&summary.model)?;
        }
        info!(
            landmark_versions = self.landmarks.versions().len(),
            models = summaries.len(),
            "Engine state loaded"
        );
        Ok(())
    }

    /// Use `embedder` for [`AtomEngine::put_embedded`].
    pub fn with_embedder(mut self, embedder: impl DynEmbeddingService + 'static) -> Self {
        self.embedder = Some(Arc::new(embedder));
        self
    }

    pub fn config(&self) -> &AtomConfig {
        &self.config
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Receive domain events. Slow receivers lose the oldest events.
    pub fn subscribe(&self) -> broadcast::Receiver<AtomEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: AtomEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }

    // =========================================================================
    // Producer operations
    // =========================================================================

    /// Store content under the default tenant.
    pub fn put(&self, content: &[u8], modality: Modality) -> Result<AtomRef> {
        self.put_in(&self.config.general.tenant, content, modality)
    }

    pub fn put_in(&self, tenant: &str, content: &[u8], modality: Modality) -> Result<AtomRef> {
        let atom = self.store.put(tenant, content, modality)?;
        if atom.is_new {
            self.emit(AtomEvent::AtomCreated {
                atom_id: atom.id,
                fingerprint: atom.fingerprint,
                modality,
                byte_len: content.len() as u64,
                timestamp: Utc::now(),
            });
        }
        Ok(atom)
    }

    /// Store content together with a precomputed embedding.
    ///
    /// The vector is checked before anything is written.
    pub fn put_with_vector(
        &self,
        content: &[u8],
        modality: Modality,
        model: &ModelVersion,
        vector: &[f32],
    ) -> Result<AtomRef> {
        model.validate()?;
        self.vectors.check(model, vector)?;
        let atom = self.put(content, modality)?;
        self.attach_vector(atom.id, model, vector)?;
        Ok(atom)
    }

    /// Embed content with the configured service, then store both.
    pub async fn put_embedded(&self, content: &[u8], modality: Modality) -> Result<AtomRef> {
        let embedder = self
            .embedder
            .as_ref()
            .ok_or_else(|| AtomError::Validation("no embedding service configured".to_string()))?;
        let vector = embedder.embed_boxed(content).await?;
        self.put_with_vector(content, modality, &embedder.model(), &vector)
    }

    /// Store a batch under the default tenant. Items carrying vectors store
    /// them under `model`; every vector is checked before anything is
    /// written. Repeated content keeps the vector of its first occurrence.
    pub fn put_batch(&self, items: &[BatchItem], model: Option<&ModelVersion>) -> Result<BatchOutcome> {
        self.check_batch_vectors(items, model)?;
        let outcome = BulkIngest::new(&self.store).put_batch(&self.config.general.tenant, items)?;

        for (item, atom) in items.iter().zip(&outcome.items) {
            if atom.is_new {
                self.emit(AtomEvent::AtomCreated {
                    atom_id: atom.id,
                    fingerprint: atom.fingerprint,
                    modality: item.modality,
                    byte_len: item.content.len() as u64,
                    timestamp: Utc::now(),
                });
            }
            if let (Some(vector), Some(model)) = (&item.vector, model) {
                self.attach_vector(atom.id, model, vector)?;
            }
        }
        Ok(outcome)
    }

    fn check_batch_vectors(&self, items: &[BatchItem], model: Option<&ModelVersion>) -> Result<()> {
        let mut dimension = None;
        for item in items {
            let Some(vector) = &item.vector else {
                continue;
            };
            let model = model.ok_or_else(|| {
                AtomError::Validation("batch carries vectors but names no model".to_string())
            })?;
            model.validate()?;
            self.vectors.check(model, vector)?;
            match dimension {
                Some(d) if d != vector.len() => {
                    return Err(AtomError::DimensionMismatch {
                        expected: d,
                        actual: vector.len(),
                    })
                }
                _ => dimension = Some(vector.len()),
            }
        }
        Ok(())
    }

    /// Store an embedding for an existing atom and schedule its spatial key.
    ///
    /// Returns `false` if the atom already had a vector for this model.
    pub fn attach_vector(&self, atom_id: AtomId, model: &ModelVersion, vector: &[f32]) -> Result<bool> {
        validate_vector(vector)?;
        self.vectors.check(model, vector)?;
        if self.store.atom(atom_id)?.is_none() {
            return Err(AtomError::NotFound(format!("atom {}", atom_id)));
        }
        let saved = self.embeddings.save(atom_id, model, vector)?;
        if saved {
            self.vectors.insert(model, atom_id, Arc::from(vector))?;
            self.schedule_key(atom_id, model);
        }
        Ok(saved)
    }

    fn schedule_key(&self, atom_id: AtomId, model: &ModelVersion) {
        if self.config.maintenance.background_keys {
            if let Some(queue) = self.key_queue.get() {
                let job = KeyJob {
                    atom_id,
                    model: model.clone(),
                };
                match queue.enqueue(job) {
                    Ok(()) => return,
                    Err(e) => warn!(atom_id = %atom_id, "Key queue unavailable, indexing inline: {}", e),
                }
            }
        }
        if let Err(e) = self.maintainer.index_atom(model, atom_id) {
            // The next rebuild or restore keys the atom.
            warn!(atom_id = %atom_id, model = %model, "Spatial key not computed: {}", e);
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Original bytes of an atom.
    pub fn get(&self, id: AtomId) -> Result<Vec<u8>> {
        self.store.get(id)
    }

    pub fn atom(&self, id: AtomId) -> Result<Option<Atom>> {
        self.store.atom(id)
    }

    /// Drop one reference. At zero the atom awaits the next sweep past
    /// the retention window.
    pub fn release(&self, id: AtomId) -> Result<u64> {
        let remaining = self.store.release(id)?;
        if remaining == 0 {
            self.emit(AtomEvent::AtomReleased {
                atom_id: id,
                timestamp: Utc::now(),
            });
        }
        Ok(remaining)
    }

    /// Approximate top-k neighbors. See [`QueryEngine::k_nearest`].
    pub fn k_nearest(&self, query: &KnnQuery) -> Result<KnnResult> {
        let query = self.with_default_timeout(query);
        let result = self.queries.k_nearest(&query)?;
        if let Some(reason) = &result.degraded_reason {
            self.emit(AtomEvent::QueryDegraded {
                model: query.model.clone(),
                reason: reason.clone(),
                timestamp: Utc::now(),
            });
        }
        Ok(result)
    }

    /// Run a query against a snapshot obtained earlier from
    /// [`AtomEngine::index`].
    pub fn k_nearest_in(&self, index: &Arc<SpatialIndex>, query: &KnnQuery) -> Result<KnnResult> {
        let query = self.with_default_timeout(query);
        self.queries.k_nearest_in(index, &query)
    }

    fn with_default_timeout(&self, query: &KnnQuery) -> KnnQuery {
        let mut query = query.clone();
        if let Some(ms) = self.config.query.timeout_ms {
            query = query.with_timeout(std::time::Duration::from_millis(ms));
        }
        query
    }

    /// Current snapshot of a model's index.
    pub fn index(&self, model: &ModelVersion) -> Option<Arc<SpatialIndex>> {
        self.indexes.get(model)
    }

    pub fn stats(&self) -> Result<EngineStats> {
        let store = self.store.stats()?;
        let models = self
            .vectors
            .models()
            .into_iter()
            .filter_map(|model| {
                let table = self.vectors.model(&model)?;
                let index = self.indexes.get(&model);
                Some(ModelStats {
                    dimension: table.dimension(),
                    vectors: table.len(),
                    indexed: index.as_ref().map_or(0, |i| i.len()),
                    delta: index.as_ref().map_or(0, |i| i.delta_len()),
                    partitions: index.as_ref().map_or(0, |i| i.partitions().len()),
                    landmark_version: index.as_ref().map(|i| i.landmark_version()),
                    partition_version: index.as_ref().map(|i| i.partition_version()),
                    model,
                })
            })
            .collect();
        Ok(EngineStats {
            atoms: store.atoms,
            live: store.live,
            awaiting_sweep: store.awaiting_sweep,
            overflow: store.overflow,
            blobs: store.blobs,
            total_bytes: store.total_bytes,
            landmark_versions: self.landmarks.versions(),
            pending_keys: self.pending_keys(),
            models,
        })
    }

    // =========================================================================
    // Administrative operations
    // =========================================================================

    /// Build and append a new landmark set version.
    pub fn publish_landmarks(&self, source: LandmarkSource) -> Result<Arc<LandmarkSet>> {
        let _guard = self
            .publish_lock
            .lock()
            .map_err(|e| AtomError::Storage(format!("Lock poisoned: {}", e)))?;
        let version = self.landmarks.next_version();
        let projection = &self.config.projection;
        let set = match source {
            LandmarkSource::Vectors(vectors) => LandmarkSet::from_vectors(version, vectors)?,
            LandmarkSource::Random { dimension } => LandmarkSet::generate(
                version,
                dimension,
                projection.landmark_count,
                projection.landmark_seed.wrapping_add(version as u64),
            )?,
            LandmarkSource::Sample { model } => {
                let table = self
                    .vectors
                    .model(&model)
                    .ok_or_else(|| AtomError::NotFound(format!("no vectors stored for model {}", model)))?;
                let sample: Vec<_> = table.snapshot()?.into_iter().map(|(_, v)| v).collect();
                LandmarkSet::from_sample(
                    version,
                    &sample,
                    projection.landmark_count,
                    projection.sample_iterations,
                    projection.landmark_seed.wrapping_add(version as u64),
                )?
            }
        };
        Projector::check_landmarks(&set, projection)?;

        self.landmark_repo.append(&set.to_record())?;
        let set = self.landmarks.publish(set)?;
        self.emit(AtomEvent::LandmarksPublished {
            version: set.version(),
            dimension: set.dimension(),
            landmark_count: set.len(),
            timestamp: Utc::now(),
        });
        Ok(set)
    }

    pub fn landmarks(&self) -> Option<Arc<LandmarkSet>> {
        self.landmarks.latest()
    }

    /// Rebuild a model's partitions and index under the latest landmarks.
    pub fn rebuild_index(&self, model: &ModelVersion, budget: &Budget) -> Result<RebuildReport> {
        let report = self.maintainer.rebuild(model, budget)?;
        self.emit_rebuilt(&report);
        Ok(report)
    }

    /// [`AtomEngine::rebuild_index`] on the blocking pool.
    pub async fn rebuild_index_async(&self, model: &ModelVersion, budget: Budget) -> Result<RebuildReport> {
        let report = self.maintainer.rebuild_async(model.clone(), budget).await?;
        self.emit_rebuilt(&report);
        Ok(report)
    }

    fn emit_rebuilt(&self, report: &RebuildReport) {
        self.emit(AtomEvent::IndexRebuilt {
            job_id: report.job_id,
            model: report.model.clone(),
            landmark_version: report.landmark_version,
            partition_version: report.partition_version,
            partitions: report.partitions,
            atoms: report.atoms,
            timestamp: Utc::now(),
        });
    }

    /// Delete atoms released longer ago than the retention window, with
    /// their vectors and index entries.
    pub fn collect_garbage(&self, budget: &Budget) -> Result<SweepReport> {
        let report = self.gc.sweep(budget)?;
        if !report.collected.is_empty() {
            let vectors = self.vectors.remove_atoms(&report.collected);
            let mut unindexed = 0;
            for model in self.indexes.models() {
                if let Some(index) = self.indexes.get(&model) {
                    unindexed += index.remove(&report.collected)?;
                }
            }
            debug!(
                atoms = report.collected.len(),
                vectors,
                unindexed,
                "Collected atoms dropped from cache and indexes"
            );
            self.emit(AtomEvent::AtomsCollected {
                atom_ids: report.collected.clone(),
                blobs_deleted: report.blobs_deleted,
                timestamp: Utc::now(),
            });
        }
        Ok(report)
    }

    /// Drop every vector, key and the index of a model version.
    pub fn retire_model(&self, model: &ModelVersion) -> Result<usize> {
        let deleted = self.embeddings.retire_model(model)?;
        self.indexes.remove(model);
        self.vectors.remove_model(model);
        self.emit(AtomEvent::ModelRetired {
            model: model.clone(),
            vectors_deleted: deleted,
            timestamp: Utc::now(),
        });
        Ok(deleted)
    }

    /// Start computing spatial keys on a background task instead of inline.
    ///
    /// Must be called from within a tokio runtime, and at most once.
    pub fn spawn_key_worker(&self) -> Result<JoinHandle<()>> {
        tokio::runtime::Handle::try_current()
            .map_err(|e| AtomError::Validation(format!("key worker needs a tokio runtime: {}", e)))?;
        if self.key_queue.get().is_some() {
            return Err(AtomError::Validation("key worker already running".to_string()));
        }
        let (queue, handle) = spawn_key_worker(Arc::clone(&self.maintainer));
        if self.key_queue.set(queue).is_err() {
            handle.abort();
            return Err(AtomError::Validation("key worker already running".to_string()));
        }
        info!("Spatial key worker started");
        Ok(handle)
    }

    /// Keys waiting on the background worker.
    pub fn pending_keys(&self) -> usize {
        self.key_queue.get().map_or(0, KeyQueue::pending)
    }

    /// Wait until the background worker has caught up.
    pub async fn flush_keys(&self) {
        if let Some(queue) = self.key_queue.get() {
            queue.drain().await;
        }
    }
}
