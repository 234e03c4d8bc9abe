//! atomdb storage crate - SQLite persistence for atoms and projection state.
//!
//! Provides a WAL-mode SQLite database with migrations, the deduplicating
//! fingerprint store with overflow blobs, repositories for embeddings,
//! spatial keys, landmark and partition versions, and the garbage sweep.

pub mod db;
pub mod fingerprint;
pub mod gc;
pub mod migrations;
pub mod overflow;
pub mod repository;

pub use db::Database;
pub use fingerprint::{FingerprintStore, PutEntry, StoreStats};
pub use gc::{GarbageCollector, SweepReport};
pub use overflow::OverflowCodec;
pub use repository::{
    EmbeddingRepository, LandmarkRecord, LandmarkRepository, ModelSummary, PartitionRecord,
    PartitionRepository, SpatialKeyRepository,
};
