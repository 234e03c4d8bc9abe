use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{AtomError, Result};

/// Top-level configuration for atomdb.
///
/// Loaded from `~/.atomdb/config.toml` by default. Every section falls back
/// to its defaults when omitted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AtomConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub projection: ProjectionConfig,
    #[serde(default)]
    pub partition: PartitionConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

impl AtomConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AtomConfig = toml::from_str(&content)?;
        config.validate()?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Reject settings the store cannot honour.
    pub fn validate(&self) -> Result<()> {
        let p = &self.projection;
        if !(3..=8).contains(&p.landmark_count) {
            return Err(AtomError::Config(format!(
                "projection.landmark_count must be in 3..=8, got {}",
                p.landmark_count
            )));
        }
        if p.locality_bits == 0 || p.landmark_count * p.locality_bits as usize > 64 {
            return Err(AtomError::Config(format!(
                "projection.landmark_count * locality_bits must be in 1..=64, got {} * {}",
                p.landmark_count, p.locality_bits
            )));
        }
        if !(p.coordinate_scale.is_finite() && p.coordinate_scale > 0.0) {
            return Err(AtomError::Config(
                "projection.coordinate_scale must be positive".to_string(),
            ));
        }
        if self.store.prefix_len == 0 || self.store.prefix_len > self.store.inline_threshold {
            return Err(AtomError::Config(format!(
                "store.prefix_len must be in 1..=inline_threshold ({}), got {}",
                self.store.inline_threshold, self.store.prefix_len
            )));
        }
        if self.partition.max_partitions == 0 {
            return Err(AtomError::Config(
                "partition.max_partitions must be at least 1".to_string(),
            ));
        }
        let q = &self.query;
        if !(q.initial_radius > 0.0) || !(q.widen_factor > 1.0) {
            return Err(AtomError::Config(
                "query.initial_radius must be > 0 and query.widen_factor > 1".to_string(),
            ));
        }
        if q.max_candidates == 0 || q.leaf_size == 0 {
            return Err(AtomError::Config(
                "query.max_candidates and query.leaf_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// General settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Directory holding the SQLite database.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
    /// Tenant used by the engine facade when none is given.
    pub tenant: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.atomdb/data".to_string(),
            log_level: "info".to_string(),
            tenant: "default".to_string(),
        }
    }
}

impl GeneralConfig {
    /// Data directory with a leading `~` expanded to the home directory.
    pub fn resolved_data_dir(&self) -> PathBuf {
        resolve_data_dir(&self.data_dir)
    }
}

/// Expand `~` to the home directory in a path string.
pub fn resolve_data_dir(data_dir: &str) -> PathBuf {
    if data_dir.starts_with("~/") || data_dir.starts_with("~\\") {
        #[cfg(target_os = "windows")]
        let home = std::env::var("USERPROFILE").unwrap_or_else(|_| ".".to_string());
        #[cfg(not(target_os = "windows"))]
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(&data_dir[2..])
    } else {
        PathBuf::from(data_dir)
    }
}

/// Fingerprint store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Content longer than this many bytes goes to the blob store.
    pub inline_threshold: usize,
    /// Leading content bytes kept in the atom row for overflow values.
    pub prefix_len: usize,
    /// Attempts at the dedup transaction before surfacing a conflict.
    pub max_conflict_retries: u32,
    /// Grace window between refcount reaching zero and hard deletion.
    pub retention_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            inline_threshold: 64,
            prefix_len: 8,
            max_conflict_retries: 5,
            retention_secs: 3600,
        }
    }
}

/// Landmark projection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectionConfig {
    /// Number of landmarks (dimensionality of spatial keys).
    pub landmark_count: usize,
    /// Multiplier applied to projected coordinates.
    pub coordinate_scale: f64,
    /// Bits per coordinate fed to the locality curve.
    pub locality_bits: u32,
    /// Seed for randomly generated landmark sets.
    pub landmark_seed: u64,
    /// Power iterations when deriving landmarks from a sample.
    pub sample_iterations: usize,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            landmark_count: 4,
            coordinate_scale: 1.0,
            locality_bits: 16,
            landmark_seed: 0x5eed,
            sample_iterations: 64,
        }
    }
}

/// Coarse partitioning settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionConfig {
    /// Upper bound on the number of centroids.
    pub max_partitions: usize,
    /// Keys sampled for clustering.
    pub sample_size: usize,
    /// Lloyd iteration cap.
    pub max_iterations: usize,
    /// Stop when no centroid moves further than this.
    pub tolerance: f64,
    /// Seed for k-means++ initialisation and sampling.
    pub seed: u64,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            max_partitions: 256,
            sample_size: 10_000,
            max_iterations: 25,
            tolerance: 1e-4,
            seed: 7,
        }
    }
}

/// Query settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Results returned when the caller does not say.
    pub default_k: usize,
    /// Starting Stage A radius, in spatial-key units.
    pub initial_radius: f64,
    /// Radius multiplier per widening step.
    pub widen_factor: f64,
    /// Widening steps before giving up with a partial result.
    pub max_widen_steps: u32,
    /// Stage A keeps widening until it holds `k * candidate_factor` candidates.
    pub candidate_factor: usize,
    /// Hard cap on candidates handed to Stage B.
    pub max_candidates: usize,
    /// Points per k-d tree leaf.
    pub leaf_size: usize,
    /// Optional per-query time budget in milliseconds.
    pub timeout_ms: Option<u64>,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_k: 10,
            initial_radius: 0.05,
            widen_factor: 1.5,
            max_widen_steps: 12,
            candidate_factor: 8,
            max_candidates: 4096,
            leaf_size: 16,
            timeout_ms: None,
        }
    }
}

/// Background maintenance settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Compute spatial keys for new atoms on a background worker instead of inline.
    pub background_keys: bool,
    /// Rows examined per cancellation check during a garbage sweep.
    pub gc_batch_size: usize,
    /// The key worker rebuilds a model's index once its delta buffer holds
    /// more keys than this. 0 disables it.
    pub max_delta: usize,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            background_keys: true,
            gc_batch_size: 512,
            max_delta: 20_000,
        }
    }
}
