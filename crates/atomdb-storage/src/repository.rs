//! Repositories for vectors and the versioned projection state.
//!
//! Provides EmbeddingRepository, SpatialKeyRepository, LandmarkRepository and
//! PartitionRepository over the shared Database using raw SQL. Vectors,
//! coordinates and centroids are stored as little-endian float BLOBs so they
//! round-trip bit-exactly.

use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use atomdb_core::error::{AtomError, Result};
use atomdb_core::types::{AtomId, LocalityKey, ModelVersion, SpatialKey, Timestamp};

use crate::db::{from_millis, is_unique_violation, sql_err, to_millis, Database};

// =============================================================================
// Float codecs
// =============================================================================

pub fn encode_f32s(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn decode_f32s(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(AtomError::Integrity(format!(
            "f32 vector blob has {} bytes, not a multiple of 4",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

pub fn encode_f64s(values: &[f64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn decode_f64s(bytes: &[u8]) -> Result<Vec<f64>> {
    if bytes.len() % 8 != 0 {
        return Err(AtomError::Integrity(format!(
            "f64 blob has {} bytes, not a multiple of 8",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect())
}

fn encode_rows(rows: &[Vec<f64>]) -> Vec<u8> {
    rows.iter().flat_map(|r| encode_f64s(r)).collect()
}

fn decode_rows(bytes: &[u8], count: usize, width: usize) -> Result<Vec<Vec<f64>>> {
    let flat = decode_f64s(bytes)?;
    if flat.len() != count * width {
        return Err(AtomError::Integrity(format!(
            "expected {} x {} values, found {}",
            count,
            width,
            flat.len()
        )));
    }
    if width == 0 {
        return Ok(vec![Vec::new(); count]);
    }
    Ok(flat.chunks_exact(width).map(<[f64]>::to_vec).collect())
}

fn get_err(e: rusqlite::Error) -> AtomError {
    AtomError::Storage(e.to_string())
}

// =============================================================================
// Embeddings
// =============================================================================

/// Per-model summary of stored vectors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSummary {
    pub model: ModelVersion,
    pub dimension: usize,
    pub vectors: u64,
}

/// Full-precision vectors keyed by (atom, model version).
pub struct EmbeddingRepository {
    db: Arc<Database>,
}

impl EmbeddingRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Store a vector for an atom under a model.
    ///
    /// The first vector stored for a model fixes its dimension. Returns
    /// `false` if the atom already had a vector for this model; the stored
    /// vector is left as it was.
    pub fn save(&self, atom_id: AtomId, model: &ModelVersion, vector: &[f32]) -> Result<bool> {
        model.validate()?;
        if vector.is_empty() {
            return Err(AtomError::Validation("embedding vector is empty".to_string()));
        }
        self.db.with_tx(|conn| {
            if let Some(expected) = model_dimension(conn, model)? {
                if expected != vector.len() {
                    return Err(AtomError::DimensionMismatch {
                        expected,
                        actual: vector.len(),
                    });
                }
            }
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO embeddings (atom_id, model, dimension, vector, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        atom_id.0,
                        model.as_str(),
                        vector.len() as i64,
                        encode_f32s(vector),
                        to_millis(Utc::now()),
                    ],
                )
                .map_err(sql_err("save embedding"))?;
            Ok(inserted > 0)
        })
    }

    pub fn dimension(&self, model: &ModelVersion) -> Result<Option<usize>> {
        self.db.with_conn(|conn| model_dimension(conn, model))
    }

    pub fn find(&self, atom_id: AtomId, model: &ModelVersion) -> Result<Option<Vec<f32>>> {
        self.db.with_conn(|conn| {
            let blob: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT vector FROM embeddings WHERE atom_id = ?1 AND model = ?2",
                    params![atom_id.0, model.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sql_err("find embedding"))?;
            blob.map(|b| decode_f32s(&b)).transpose()
        })
    }

    /// All vectors for a model, ordered by atom id.
    pub fn load_model(&self, model: &ModelVersion) -> Result<Vec<(AtomId, Vec<f32>)>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT atom_id, vector FROM embeddings WHERE model = ?1 ORDER BY atom_id")
                .map_err(sql_err("prepare load embeddings"))?;
            let rows = stmt
                .query_map(params![model.as_str()], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
                })
                .map_err(sql_err("load embeddings"))?;

            let mut out = Vec::new();
            for row in rows {
                let (id, blob) = row.map_err(get_err)?;
                out.push((AtomId(id), decode_f32s(&blob)?));
            }
            Ok(out)
        })
    }

    pub fn models(&self) -> Result<Vec<ModelSummary>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT model, MIN(dimension), COUNT(*) FROM embeddings
                     GROUP BY model ORDER BY model",
                )
                .map_err(sql_err("prepare model summary"))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(ModelSummary {
                        model: ModelVersion::new(row.get::<_, String>(0)?),
                        dimension: row.get::<_, i64>(1)? as usize,
                        vectors: row.get::<_, i64>(2)? as u64,
                    })
                })
                .map_err(sql_err("model summary"))?;
            rows.collect::<std::result::Result<_, _>>().map_err(get_err)
        })
    }

    pub fn count(&self, model: &ModelVersion) -> Result<u64> {
        self.db.with_conn(|conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM embeddings WHERE model = ?1",
                    params![model.as_str()],
                    |row| row.get(0),
                )
                .map_err(sql_err("count embeddings"))?;
            Ok(count as u64)
        })
    }

    /// Drop every vector and spatial key stored under a model version.
    ///
    /// Returns the number of vectors deleted. Partition history is kept.
    pub fn retire_model(&self, model: &ModelVersion) -> Result<usize> {
        self.db.with_tx(|conn| {
            conn.execute("DELETE FROM spatial_keys WHERE model = ?1", params![model.as_str()])
                .map_err(sql_err("delete spatial keys"))?;
            let deleted = conn
                .execute("DELETE FROM embeddings WHERE model = ?1", params![model.as_str()])
                .map_err(sql_err("delete embeddings"))?;
            info!(model = %model, vectors = deleted, "Model retired");
            Ok(deleted)
        })
    }
}

fn model_dimension(conn: &Connection, model: &ModelVersion) -> Result<Option<usize>> {
    let dim: Option<i64> = conn
        .query_row(
            "SELECT dimension FROM embeddings WHERE model = ?1 LIMIT 1",
            params![model.as_str()],
            |row| row.get(0),
        )
        .optional()
        .map_err(sql_err("model dimension"))?;
    Ok(dim.map(|d| d as usize))
}

// =============================================================================
// Spatial keys
// =============================================================================

/// Projected keys keyed by (atom, model, landmark version).
pub struct SpatialKeyRepository {
    db: Arc<Database>,
}

impl SpatialKeyRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert or replace the key for an atom. Reprocessing is harmless.
    pub fn upsert(&self, atom_id: AtomId, model: &ModelVersion, key: &SpatialKey) -> Result<()> {
        self.db.with_conn(|conn| upsert_key(conn, atom_id, model, key))
    }

    /// All keys for a model under one landmark version, in layout order
    /// (partition, then locality key).
    pub fn load(&self, model: &ModelVersion, landmark_version: u32) -> Result<Vec<(AtomId, SpatialKey)>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT atom_id, landmark_version, coords, partition_id, partition_version, locality_key
                     FROM spatial_keys WHERE model = ?1 AND landmark_version = ?2
                     ORDER BY partition_id, locality_key, atom_id",
                )
                .map_err(sql_err("prepare load keys"))?;
            let rows = stmt
                .query_map(params![model.as_str(), landmark_version as i64], |row| {
                    Ok(row_to_key(row))
                })
                .map_err(sql_err("load keys"))?;

            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(get_err)??);
            }
            Ok(out)
        })
    }

    pub fn find(
        &self,
        atom_id: AtomId,
        model: &ModelVersion,
        landmark_version: u32,
    ) -> Result<Option<SpatialKey>> {
        self.db.with_conn(|conn| {
            let found = conn
                .query_row(
                    "SELECT atom_id, landmark_version, coords, partition_id, partition_version, locality_key
                     FROM spatial_keys WHERE atom_id = ?1 AND model = ?2 AND landmark_version = ?3",
                    params![atom_id.0, model.as_str(), landmark_version as i64],
                    |row| Ok(row_to_key(row)),
                )
                .optional()
                .map_err(sql_err("find key"))?
                .transpose()?;
            Ok(found.map(|(_, key)| key))
        })
    }

    pub fn count(&self, model: &ModelVersion) -> Result<u64> {
        self.db.with_conn(|conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM spatial_keys WHERE model = ?1",
                    params![model.as_str()],
                    |row| row.get(0),
                )
                .map_err(sql_err("count keys"))?;
            Ok(count as u64)
        })
    }
}

fn upsert_key(conn: &Connection, atom_id: AtomId, model: &ModelVersion, key: &SpatialKey) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO spatial_keys
            (atom_id, model, landmark_version, coords, partition_id, partition_version, locality_key)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            atom_id.0,
            model.as_str(),
            key.landmark_version as i64,
            encode_f64s(&key.coords),
            key.partition_id as i64,
            key.partition_version as i64,
            key.locality.to_be_bytes().to_vec(),
        ],
    )
    .map_err(sql_err("upsert spatial key"))?;
    Ok(())
}

fn row_to_key(row: &Row<'_>) -> Result<(AtomId, SpatialKey)> {
    let id: i64 = row.get(0).map_err(get_err)?;
    let coords: Vec<u8> = row.get(2).map_err(get_err)?;
    let locality: Vec<u8> = row.get(5).map_err(get_err)?;
    Ok((
        AtomId(id),
        SpatialKey {
            coords: decode_f64s(&coords)?,
            locality: LocalityKey::from_be_slice(&locality)?,
            partition_id: row.get::<_, i64>(3).map_err(get_err)? as u32,
            landmark_version: row.get::<_, i64>(1).map_err(get_err)? as u32,
            partition_version: row.get::<_, i64>(4).map_err(get_err)? as u32,
        },
    ))
}

// =============================================================================
// Landmark sets
// =============================================================================

/// One persisted landmark basis version.
#[derive(Debug, Clone, PartialEq)]
pub struct LandmarkRecord {
    pub version: u32,
    pub dimension: usize,
    pub vectors: Vec<Vec<f64>>,
    pub valid_from: Timestamp,
}

/// Append-only log of landmark sets.
pub struct LandmarkRepository {
    db: Arc<Database>,
}

impl LandmarkRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Append a new version. Versions are never overwritten.
    pub fn append(&self, record: &LandmarkRecord) -> Result<()> {
        if record.vectors.iter().any(|v| v.len() != record.dimension) {
            return Err(AtomError::Validation(format!(
                "landmark set {} has vectors that are not {}-dimensional",
                record.version, record.dimension
            )));
        }
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO landmark_sets (version, dimension, landmark_count, vectors, valid_from)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.version as i64,
                    record.dimension as i64,
                    record.vectors.len() as i64,
                    encode_rows(&record.vectors),
                    to_millis(record.valid_from),
                ],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    AtomError::Validation(format!(
                        "landmark version {} already published",
                        record.version
                    ))
                } else {
                    sql_err("append landmark set")(e)
                }
            })?;
            debug!(version = record.version, "Landmark set persisted");
            Ok(())
        })
    }

    /// Every version, oldest first.
    pub fn load_all(&self) -> Result<Vec<LandmarkRecord>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT version, dimension, landmark_count, vectors, valid_from
                     FROM landmark_sets ORDER BY version",
                )
                .map_err(sql_err("prepare load landmarks"))?;
            let rows = stmt
                .query_map([], |row| Ok(row_to_landmarks(row)))
                .map_err(sql_err("load landmarks"))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(get_err)??);
            }
            Ok(out)
        })
    }

    pub fn latest(&self) -> Result<Option<LandmarkRecord>> {
        Ok(self.load_all()?.pop())
    }
}

fn row_to_landmarks(row: &Row<'_>) -> Result<LandmarkRecord> {
    let dimension = row.get::<_, i64>(1).map_err(get_err)? as usize;
    let count = row.get::<_, i64>(2).map_err(get_err)? as usize;
    let blob: Vec<u8> = row.get(3).map_err(get_err)?;
    Ok(LandmarkRecord {
        version: row.get::<_, i64>(0).map_err(get_err)? as u32,
        dimension,
        vectors: decode_rows(&blob, count, dimension)?,
        valid_from: from_millis(row.get(4).map_err(get_err)?)?,
    })
}

// =============================================================================
// Partition sets
// =============================================================================

/// One persisted centroid set for a model.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionRecord {
    pub model: ModelVersion,
    pub version: u32,
    pub landmark_version: u32,
    pub centroids: Vec<Vec<f64>>,
    pub iterations: u32,
    pub converged: bool,
    pub valid_from: Timestamp,
}

/// Append-only log of partition sets, per model.
pub struct PartitionRepository {
    db: Arc<Database>,
}

impl PartitionRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn next_version(&self, model: &ModelVersion) -> Result<u32> {
        self.db.with_conn(|conn| {
            let max: i64 = conn
                .query_row(
                    "SELECT COALESCE(MAX(version), 0) FROM partition_sets WHERE model = ?1",
                    params![model.as_str()],
                    |row| row.get(0),
                )
                .map_err(sql_err("next partition version"))?;
            Ok(max as u32 + 1)
        })
    }

    /// Persist a centroid set together with the keys assigned under it.
    ///
    /// Both land in one transaction, so a reader never sees keys that refer
    /// to an unpublished partition version.
    pub fn publish(&self, record: &PartitionRecord, keys: &[(AtomId, SpatialKey)]) -> Result<()> {
        let width = record.centroids.first().map_or(0, Vec::len);
        if record.centroids.iter().any(|c| c.len() != width) {
            return Err(AtomError::Validation(
                "partition centroids have inconsistent dimensionality".to_string(),
            ));
        }
        self.db.with_tx(|conn| {
            conn.execute(
                "INSERT INTO partition_sets
                    (model, version, landmark_version, key_dimension, centroid_count, centroids,
                     iterations, converged, valid_from)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.model.as_str(),
                    record.version as i64,
                    record.landmark_version as i64,
                    width as i64,
                    record.centroids.len() as i64,
                    encode_rows(&record.centroids),
                    record.iterations as i64,
                    record.converged as i32,
                    to_millis(record.valid_from),
                ],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    AtomError::ConcurrencyConflict { attempts: 1 }
                } else {
                    sql_err("insert partition set")(e)
                }
            })?;
            for (atom_id, key) in keys {
                upsert_key(conn, *atom_id, &record.model, key)?;
            }
            info!(
                model = %record.model,
                version = record.version,
                partitions = record.centroids.len(),
                keys = keys.len(),
                "Partition set published"
            );
            Ok(())
        })
    }

    /// Every version for a model, oldest first.
    pub fn load_all(&self, model: &ModelVersion) -> Result<Vec<PartitionRecord>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT model, version, landmark_version, key_dimension, centroid_count, centroids,
                            iterations, converged, valid_from
                     FROM partition_sets WHERE model = ?1 ORDER BY version",
                )
                .map_err(sql_err("prepare load partitions"))?;
            let rows = stmt
                .query_map(params![model.as_str()], |row| Ok(row_to_partitions(row)))
                .map_err(sql_err("load partitions"))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(get_err)??);
            }
            Ok(out)
        })
    }

    pub fn latest(&self, model: &ModelVersion) -> Result<Option<PartitionRecord>> {
        Ok(self.load_all(model)?.pop())
    }
}

fn row_to_partitions(row: &Row<'_>) -> Result<PartitionRecord> {
    let width = row.get::<_, i64>(3).map_err(get_err)? as usize;
    let count = row.get::<_, i64>(4).map_err(get_err)? as usize;
    let blob: Vec<u8> = row.get(5).map_err(get_err)?;
    Ok(PartitionRecord {
        model: ModelVersion::new(row.get::<_, String>(0).map_err(get_err)?),
        version: row.get::<_, i64>(1).map_err(get_err)? as u32,
        landmark_version: row.get::<_, i64>(2).map_err(get_err)? as u32,
        centroids: decode_rows(&blob, count, width)?,
        iterations: row.get::<_, i64>(6).map_err(get_err)? as u32,
        converged: row.get::<_, i32>(7).map_err(get_err)? != 0,
        valid_from: from_millis(row.get(8).map_err(get_err)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::FingerprintStore;
    use atomdb_core::config::StoreConfig;
    use atomdb_core::types::Modality;

    fn setup() -> (Arc<Database>, FingerprintStore) {
        let db = Arc::new(Database::in_memory().unwrap());
        let store = FingerprintStore::new(Arc::clone(&db), &StoreConfig::default());
        (db, store)
    }

    fn landmarks(version: u32) -> LandmarkRecord {
        LandmarkRecord {
            version,
            dimension: 3,
            vectors: vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0], vec![0.0, 0.0, 1.0]],
            valid_from: Utc::now(),
        }
    }

    fn key(partition_id: u32, locality: u64) -> SpatialKey {
        SpatialKey {
            coords: vec![0.1, -0.2, 0.3],
            locality: LocalityKey(locality),
            partition_id,
            landmark_version: 1,
            partition_version: 1,
        }
    }

    #[test]
    fn test_float_codecs_are_exact() {
        let v = vec![0.1f32, -3.5, f32::MIN_POSITIVE, 1e30];
        assert_eq!(decode_f32s(&encode_f32s(&v)).unwrap(), v);
        let w = vec![std::f64::consts::PI, -0.0, 1e-300];
        assert_eq!(decode_f64s(&encode_f64s(&w)).unwrap(), w);
        assert!(decode_f32s(&[1, 2, 3]).unwrap_err().is_integrity());
    }

    #[test]
    fn test_embedding_dimension_fixed_by_first_vector() {
        let (db, store) = setup();
        let repo = EmbeddingRepository::new(Arc::clone(&db));
        let model = ModelVersion::new("mini-v1");
        let a = store.put("default", b"a", Modality::Text).unwrap();
        let b = store.put("default", b"b", Modality::Text).unwrap();

        assert!(repo.save(a.id, &model, &[1.0, 0.0, 0.0]).unwrap());
        assert!(!repo.save(a.id, &model, &[0.0, 1.0, 0.0]).unwrap());
        let err = repo.save(b.id, &model, &[1.0, 0.0]).unwrap_err();
        assert!(matches!(err, AtomError::DimensionMismatch { expected: 3, actual: 2 }));

        assert_eq!(repo.find(a.id, &model).unwrap(), Some(vec![1.0, 0.0, 0.0]));
        assert_eq!(repo.dimension(&model).unwrap(), Some(3));
    }

    #[test]
    fn test_embedding_requires_existing_atom() {
        let (db, _store) = setup();
        let repo = EmbeddingRepository::new(db);
        assert!(repo.save(AtomId(42), &ModelVersion::new("m"), &[1.0]).is_err());
    }

    #[test]
    fn test_load_model_and_summary() {
        let (db, store) = setup();
        let repo = EmbeddingRepository::new(Arc::clone(&db));
        let m1 = ModelVersion::new("m1");
        let m2 = ModelVersion::new("m2");
        for i in 0..3u8 {
            let atom = store.put("default", &[i], Modality::Binary).unwrap();
            repo.save(atom.id, &m1, &[i as f32, 1.0]).unwrap();
        }
        let atom = store.put("default", b"z", Modality::Text).unwrap();
        repo.save(atom.id, &m2, &[1.0, 2.0, 3.0, 4.0]).unwrap();

        let loaded = repo.load_model(&m1).unwrap();
        assert_eq!(loaded.len(), 3);
        assert!(loaded.windows(2).all(|w| w[0].0 < w[1].0));

        let summary = repo.models().unwrap();
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[1].dimension, 4);
        assert_eq!(summary[0].vectors, 3);
    }

    #[test]
    fn test_retire_model_drops_vectors_and_keys() {
        let (db, store) = setup();
        let embeddings = EmbeddingRepository::new(Arc::clone(&db));
        let keys = SpatialKeyRepository::new(Arc::clone(&db));
        LandmarkRepository::new(Arc::clone(&db)).append(&landmarks(1)).unwrap();
        let model = ModelVersion::new("old");

        let atom = store.put("default", b"x", Modality::Text).unwrap();
        embeddings.save(atom.id, &model, &[1.0, 0.0, 0.0]).unwrap();
        keys.upsert(atom.id, &model, &key(0, 1)).unwrap();

        assert_eq!(embeddings.retire_model(&model).unwrap(), 1);
        assert_eq!(embeddings.count(&model).unwrap(), 0);
        assert_eq!(keys.count(&model).unwrap(), 0);
        assert!(store.atom(atom.id).unwrap().is_some());
    }

    #[test]
    fn test_spatial_keys_load_in_layout_order() {
        let (db, store) = setup();
        let repo = SpatialKeyRepository::new(Arc::clone(&db));
        let model = ModelVersion::new("m");
        let specs = [(1, 5), (0, 9), (1, 2), (0, 3)];
        for (i, (partition, locality)) in specs.iter().enumerate() {
            let atom = store.put("default", &[i as u8], Modality::Binary).unwrap();
            repo.upsert(atom.id, &model, &key(*partition, *locality)).unwrap();
        }

        let loaded = repo.load(&model, 1).unwrap();
        let order: Vec<(u32, u64)> = loaded
            .iter()
            .map(|(_, k)| (k.partition_id, k.locality.0))
            .collect();
        assert_eq!(order, vec![(0, 3), (0, 9), (1, 2), (1, 5)]);
        assert_eq!(loaded[0].1.coords, vec![0.1, -0.2, 0.3]);

        let (id, k) = &loaded[2];
        assert_eq!(repo.find(*id, &model, 1).unwrap().as_ref(), Some(k));
        assert!(repo.find(*id, &model, 2).unwrap().is_none());
    }

    #[test]
    fn test_upsert_key_is_idempotent() {
        let (db, store) = setup();
        let repo = SpatialKeyRepository::new(Arc::clone(&db));
        let model = ModelVersion::new("m");
        let atom = store.put("default", b"k", Modality::Text).unwrap();
        repo.upsert(atom.id, &model, &key(0, 1)).unwrap();
        repo.upsert(atom.id, &model, &key(3, 4)).unwrap();
        assert_eq!(repo.count(&model).unwrap(), 1);
        assert_eq!(repo.find(atom.id, &model, 1).unwrap().unwrap().partition_id, 3);
    }

    #[test]
    fn test_landmark_log_is_append_only() {
        let (db, _store) = setup();
        let repo = LandmarkRepository::new(db);
        assert!(repo.latest().unwrap().is_none());

        repo.append(&landmarks(1)).unwrap();
        repo.append(&landmarks(2)).unwrap();
        let err = repo.append(&landmarks(2)).unwrap_err();
        assert!(matches!(err, AtomError::Validation(_)));

        let all = repo.load_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].vectors[1], vec![0.0, 1.0, 0.0]);
        assert_eq!(repo.latest().unwrap().unwrap().version, 2);
    }

    #[test]
    fn test_partition_publish_with_keys() {
        let (db, store) = setup();
        LandmarkRepository::new(Arc::clone(&db)).append(&landmarks(1)).unwrap();
        let partitions = PartitionRepository::new(Arc::clone(&db));
        let keys = SpatialKeyRepository::new(Arc::clone(&db));
        let model = ModelVersion::new("m");

        assert_eq!(partitions.next_version(&model).unwrap(), 1);
        let atom = store.put("default", b"p", Modality::Text).unwrap();
        let record = PartitionRecord {
            model: model.clone(),
            version: 1,
            landmark_version: 1,
            centroids: vec![vec![0.0, 0.0, 0.0], vec![1.0, 1.0, 1.0]],
            iterations: 4,
            converged: true,
            valid_from: Utc::now(),
        };
        partitions.publish(&record, &[(atom.id, key(1, 7))]).unwrap();

        assert_eq!(partitions.next_version(&model).unwrap(), 2);
        let latest = partitions.latest(&model).unwrap().unwrap();
        assert_eq!(latest.centroids, record.centroids);
        assert!(latest.converged);
        assert_eq!(keys.count(&model).unwrap(), 1);

        let err = partitions.publish(&record, &[]).unwrap_err();
        assert!(err.is_retryable());
    }
}
