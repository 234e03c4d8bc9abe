//! Projection of embedding vectors to spatial keys.
//!
//! A projector binds one landmark set to a coordinate scale and a locality
//! curve. It is a pure function of its inputs: the same vector under the
//! same landmark version always gives bit-identical coordinates.

use std::sync::Arc;

use atomdb_core::config::ProjectionConfig;
use atomdb_core::error::{AtomError, Result};
use atomdb_core::types::{LocalityKey, SpatialKey};

use crate::curve::LocalityCurve;
use crate::landmark::LandmarkSet;
use crate::partition::PartitionSet;

#[derive(Debug, Clone)]
pub struct Projector {
    landmarks: Arc<LandmarkSet>,
    scale: f64,
    curve: LocalityCurve,
}

impl Projector {
    pub fn new(landmarks: Arc<LandmarkSet>, scale: f64, locality_bits: u32) -> Result<Self> {
        if !(scale.is_finite() && scale > 0.0) {
            return Err(AtomError::Validation(format!(
                "coordinate scale must be positive, got {}",
                scale
            )));
        }
        // Coordinates of a unit vector in an orthonormal basis lie in [-1, 1].
        let curve = LocalityCurve::new(landmarks.len(), locality_bits, -scale, scale)?;
        Ok(Self {
            landmarks,
            scale,
            curve,
        })
    }

    pub fn from_config(landmarks: Arc<LandmarkSet>, config: &ProjectionConfig) -> Result<Self> {
        Self::new(landmarks, config.coordinate_scale, config.locality_bits)
    }

    /// Fail unless `landmarks` can back a projector under `config`.
    ///
    /// Every key axis takes `locality_bits` bits of the 64-bit locality key,
    /// so a set with too many landmarks could never be indexed.
    pub fn check_landmarks(landmarks: &LandmarkSet, config: &ProjectionConfig) -> Result<()> {
        let bits = landmarks.len() * config.locality_bits as usize;
        if landmarks.is_empty() || config.locality_bits == 0 || bits > 64 {
            return Err(AtomError::Validation(format!(
                "{} landmarks at {} locality bits each need {} bits, the locality key holds 64",
                landmarks.len(),
                config.locality_bits,
                bits
            )));
        }
        let scale = config.coordinate_scale;
        LocalityCurve::new(landmarks.len(), config.locality_bits, -scale, scale).map(|_| ())
    }

    pub fn landmarks(&self) -> &Arc<LandmarkSet> {
        &self.landmarks
    }

    pub fn landmark_version(&self) -> u32 {
        self.landmarks.version()
    }

    /// Dimensionality of the input vectors.
    pub fn input_dimension(&self) -> usize {
        self.landmarks.dimension()
    }

    /// Dimensionality of the spatial keys.
    pub fn key_dimension(&self) -> usize {
        self.landmarks.len()
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn curve(&self) -> &LocalityCurve {
        &self.curve
    }

    /// Low-dimensional coordinates of a vector.
    ///
    /// Rejects vectors whose dimensionality differs from the landmarks'.
    pub fn project(&self, vector: &[f32]) -> Result<Vec<f64>> {
        let mut coords = self.landmarks.coordinates(vector)?;
        coords.iter_mut().for_each(|c| *c *= self.scale);
        Ok(coords)
    }

    pub fn locality(&self, coords: &[f64]) -> Result<LocalityKey> {
        self.curve.encode(coords)
    }

    /// Full spatial key: coordinates, locality value and partition.
    ///
    /// Without a partition set the key lands in partition 0 of version 0.
    pub fn project_to_key(
        &self,
        vector: &[f32],
        partitions: Option<&PartitionSet>,
    ) -> Result<SpatialKey> {
        let coords = self.project(vector)?;
        self.key_for(coords, partitions)
    }

    /// Spatial key for coordinates already produced by [`Projector::project`].
    pub fn key_for(&self, coords: Vec<f64>, partitions: Option<&PartitionSet>) -> Result<SpatialKey> {
        let (partition_id, partition_version) = match partitions {
            Some(set) => {
                if set.landmark_version() != self.landmark_version() {
                    return Err(AtomError::Validation(format!(
                        "partition set {} was built for landmark version {}, projector uses {}",
                        set.version(),
                        set.landmark_version(),
                        self.landmark_version()
                    )));
                }
                (set.assign(&coords), set.version())
            }
            None => (0, 0),
        };
        Ok(SpatialKey {
            locality: self.locality(&coords)?,
            coords,
            partition_id,
            landmark_version: self.landmark_version(),
            partition_version,
        })
    }
}
