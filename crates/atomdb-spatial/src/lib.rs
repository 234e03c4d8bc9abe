//! atomdb spatial crate - landmark projection, partitions, spatial index and the engine facade.
//!
//! Vectors are projected onto a small versioned set of landmark directions,
//! the projected coordinates are clustered into partitions and ordered along
//! a locality-preserving curve. Queries gather candidates from the partition
//! trees with a widening radius, then re-rank them by exact cosine similarity
//! against the full vectors. `AtomEngine` ties this to the deduplicating
//! atom store.

pub mod curve;
pub mod embedding;
pub mod engine;
pub mod ingest;
pub mod kdtree;
pub mod landmark;
pub mod maintenance;
pub mod partition;
pub mod projector;
pub mod query;
pub mod spatial_index;
pub mod vectors;

pub use curve::LocalityCurve;
pub use embedding::{DynEmbeddingService, EmbeddingService, HashEmbedding};
pub use engine::{AtomEngine, EngineStats, LandmarkSource, ModelStats};
pub use ingest::{BatchItem, BatchOutcome, BulkIngest};
pub use landmark::{LandmarkRegistry, LandmarkSet};
pub use maintenance::{IndexMaintainer, KeyQueue, RebuildReport};
pub use partition::PartitionSet;
pub use projector::Projector;
pub use query::{KnnQuery, KnnResult, QueryEngine, ResultSource, Truncation};
pub use spatial_index::{IndexRegistry, SpatialIndex};
pub use vectors::{cosine_similarity, ModelVectors, VectorStore};
