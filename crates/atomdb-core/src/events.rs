use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{AtomId, Fingerprint, Modality, ModelVersion, Timestamp};

/// Domain events emitted by the store after state changes.
///
/// Consumed by audit and provenance listeners subscribed to the engine's
/// broadcast channel. Emission is best-effort: a lagging or absent
/// subscriber never blocks the store.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub enum AtomEvent {
    /// A new atom was created by a put.
    AtomCreated {
        atom_id: AtomId,
        fingerprint: Fingerprint,
        modality: Modality,
        byte_len: u64,
        timestamp: Timestamp,
    },

    /// An atom's reference count dropped to zero; it is now awaiting sweep.
    AtomReleased { atom_id: AtomId, timestamp: Timestamp },

    /// A garbage sweep removed atoms past their retention window.
    AtomsCollected {
        atom_ids: Vec<AtomId>,
        blobs_deleted: usize,
        timestamp: Timestamp,
    },

    /// A new landmark-set version was appended.
    LandmarksPublished {
        version: u32,
        dimension: usize,
        landmark_count: usize,
        timestamp: Timestamp,
    },

    /// A spatial index rebuild finished and was swapped in.
    IndexRebuilt {
        job_id: Uuid,
        model: ModelVersion,
        landmark_version: u32,
        partition_version: u32,
        partitions: usize,
        atoms: usize,
        timestamp: Timestamp,
    },

    /// A query fell back to the linear scan.
    QueryDegraded {
        model: ModelVersion,
        reason: String,
        timestamp: Timestamp,
    },

    /// All vectors and keys for a model version were dropped.
    ModelRetired {
        model: ModelVersion,
        vectors_deleted: usize,
        timestamp: Timestamp,
    },
}

impl AtomEvent {
    pub fn timestamp(&self) -> Timestamp {
        match self {
            AtomEvent::AtomCreated { timestamp, .. }
            | AtomEvent::AtomReleased { timestamp, .. }
            | AtomEvent::AtomsCollected { timestamp, .. }
            | AtomEvent::LandmarksPublished { timestamp, .. }
            | AtomEvent::IndexRebuilt { timestamp, .. }
            | AtomEvent::QueryDegraded { timestamp, .. }
            | AtomEvent::ModelRetired { timestamp, .. } => *timestamp,
        }
    }

    /// Stable name for logs and audit records.
    pub fn event_name(&self) -> &'static str {
        match self {
            AtomEvent::AtomCreated { .. } => "atom_created",
            AtomEvent::AtomReleased { .. } => "atom_released",
            AtomEvent::AtomsCollected { .. } => "atoms_collected",
            AtomEvent::LandmarksPublished { .. } => "landmarks_published",
            AtomEvent::IndexRebuilt { .. } => "index_rebuilt",
            AtomEvent::QueryDegraded { .. } => "query_degraded",
            AtomEvent::ModelRetired { .. } => "model_retired",
        }
    }
}
