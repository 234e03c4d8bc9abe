//! Embedding service seam.
//!
//! Producers normally hand the engine a precomputed vector. When they do not,
//! an engine configured with an [`EmbeddingService`] derives one from the raw
//! content. `HashEmbedding` provides deterministic hash-based vectors for
//! tests and demos.

use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;

use atomdb_core::error::{AtomError, Result};
use atomdb_core::types::ModelVersion;

/// Service that turns raw atom content into a vector.
pub trait EmbeddingService: Send + Sync {
    /// Generate an embedding vector for the given content.
    fn embed(&self, content: &[u8]) -> impl Future<Output = Result<Vec<f32>>> + Send;

    /// Dimensionality of the vectors produced.
    fn dimensions(&self) -> usize;

    /// Model version the vectors are stored under.
    fn model(&self) -> ModelVersion;
}

/// Object-safe version of [`EmbeddingService`] for dynamic dispatch.
///
/// `EmbeddingService::embed` returns `impl Future`, so the trait cannot be
/// used as `dyn`. This one boxes the future instead; every
/// `EmbeddingService` gets it through the blanket impl below.
pub trait DynEmbeddingService: Send + Sync {
    fn embed_boxed<'a>(
        &'a self,
        content: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<f32>>> + Send + 'a>>;

    fn dimensions(&self) -> usize;

    fn model(&self) -> ModelVersion;
}

impl<T: EmbeddingService> DynEmbeddingService for T {
    fn embed_boxed<'a>(
        &'a self,
        content: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<f32>>> + Send + 'a>> {
        Box::pin(self.embed(content))
    }

    fn dimensions(&self) -> usize {
        EmbeddingService::dimensions(self)
    }

    fn model(&self) -> ModelVersion {
        EmbeddingService::model(self)
    }
}

// ---------------------------------------------------------------------------
// HashEmbedding - deterministic vectors for testing
// ---------------------------------------------------------------------------

/// Deterministic hash-based embedding.
///
/// Each component is derived from a hash of the content and the component
/// index, then the vector is L2-normalized. Identical content always yields
/// identical vectors; similar content does not yield similar vectors.
#[derive(Debug, Clone)]
pub struct HashEmbedding {
    dimensions: usize,
    model: ModelVersion,
}

impl HashEmbedding {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            model: ModelVersion::new(format!("hash-{}", dimensions)),
        }
    }

    pub fn with_model(mut self, model: impl Into<ModelVersion>) -> Self {
        self.model = model.into();
        self
    }

    fn hash_to_vector(&self, content: &[u8]) -> Vec<f32> {
        let mut result = Vec::with_capacity(self.dimensions);
        for i in 0..self.dimensions {
            let mut hasher = DefaultHasher::new();
            content.hash(&mut hasher);
            i.hash(&mut hasher);
            let h = hasher.finish();
            let val = ((h as f64) / (u64::MAX as f64)) * 2.0 - 1.0;
            result.push(val as f32);
        }

        let norm: f32 = result.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for val in &mut result {
                *val /= norm;
            }
        }
        result
    }
}

impl Default for HashEmbedding {
    fn default() -> Self {
        Self::new(64)
    }
}

impl EmbeddingService for HashEmbedding {
    async fn embed(&self, content: &[u8]) -> Result<Vec<f32>> {
        if content.is_empty() {
            return Err(AtomError::Validation("cannot embed empty content".to_string()));
        }
        Ok(self.hash_to_vector(content))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model(&self) -> ModelVersion {
        self.model.clone()
    }
}
