use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{AtomError, Result};

pub type Timestamp = DateTime<Utc>;

// =============================================================================
// Identity
// =============================================================================

/// Synthetic identifier assigned to an atom on first insert.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AtomId(pub i64);

impl fmt::Display for AtomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for AtomId {
    fn from(id: i64) -> Self {
        AtomId(id)
    }
}

/// Width of a content fingerprint in bytes (SHA-256).
pub const FINGERPRINT_LEN: usize = 32;

/// SHA-256 digest of an atom's raw bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub [u8; FINGERPRINT_LEN]);

impl Fingerprint {
    /// Hash raw content.
    pub fn of(content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content);
        Fingerprint(hasher.finalize().into())
    }

    /// Rebuild a fingerprint from a stored byte slice.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; FINGERPRINT_LEN] = bytes.try_into().map_err(|_| {
            AtomError::Integrity(format!(
                "fingerprint must be {} bytes, found {}",
                FINGERPRINT_LEN,
                bytes.len()
            ))
        })?;
        Ok(Fingerprint(arr))
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| AtomError::Validation(format!("invalid fingerprint hex: {}", e)))?;
        Self::from_slice(&bytes).map_err(|e| AtomError::Validation(e.to_string()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({}..)", &self.to_hex()[..12])
    }
}

// =============================================================================
// Enums
// =============================================================================

/// The kind of content an atom carries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    /// A text token or text fragment.
    #[default]
    Text,
    /// Image pixels or patches.
    Image,
    /// Audio samples.
    Audio,
    /// Model-weight coefficients.
    Weight,
    /// Source code fragments.
    Code,
    /// Anything else.
    Binary,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Text => "text",
            Modality::Image => "image",
            Modality::Audio => "audio",
            Modality::Weight => "weight",
            Modality::Code => "code",
            Modality::Binary => "binary",
        }
    }
}

impl FromStr for Modality {
    type Err = AtomError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "text" => Ok(Modality::Text),
            "image" => Ok(Modality::Image),
            "audio" => Ok(Modality::Audio),
            "weight" => Ok(Modality::Weight),
            "code" => Ok(Modality::Code),
            "binary" => Ok(Modality::Binary),
            other => Err(AtomError::Validation(format!("unknown modality: {}", other))),
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Atoms
// =============================================================================

/// Handle returned by `put`: which atom the content resolved to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtomRef {
    pub id: AtomId,
    /// True only for the call that created the atom.
    pub is_new: bool,
    /// Reference count after this call was applied.
    pub refcount: u64,
    pub fingerprint: Fingerprint,
}

/// How an atom's bytes are held.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StoredValue {
    /// Content at or below the inline threshold, stored in the atom row.
    Inline(Vec<u8>),
    /// Content above the threshold: the atom row keeps the composite key and
    /// the leading bytes, the full content lives in the blob store.
    Overflow { key: String, prefix: Vec<u8> },
}

impl StoredValue {
    pub fn is_overflow(&self) -> bool {
        matches!(self, StoredValue::Overflow { .. })
    }
}

/// A persisted atom record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Atom {
    pub id: AtomId,
    pub tenant: String,
    pub fingerprint: Fingerprint,
    pub modality: Modality,
    pub byte_len: u64,
    pub value: StoredValue,
    pub refcount: u64,
    pub created_at: Timestamp,
    pub last_accessed_at: Timestamp,
    /// Set when the refcount last dropped to zero; cleared on revival.
    pub released_at: Option<Timestamp>,
}

impl Atom {
    /// Whether a garbage sweep at `now` with the given retention may delete it.
    pub fn is_collectable(&self, now: Timestamp, retention: chrono::Duration) -> bool {
        self.refcount == 0
            && self
                .released_at
                .map(|released| released + retention <= now)
                .unwrap_or(false)
    }
}

// =============================================================================
// Embeddings and spatial keys
// =============================================================================

/// Identifier of the embedding model (and its version) a vector came from.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelVersion(String);

impl ModelVersion {
    pub fn new(name: impl Into<String>) -> Self {
        ModelVersion(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn validate(&self) -> Result<()> {
        if self.0.trim().is_empty() {
            return Err(AtomError::Validation(
                "model version must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for ModelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModelVersion {
    fn from(s: &str) -> Self {
        ModelVersion::new(s)
    }
}

impl From<String> for ModelVersion {
    fn from(s: String) -> Self {
        ModelVersion::new(s)
    }
}

/// Ordering value produced by the locality curve.
///
/// Persisted big-endian so byte order matches integer order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalityKey(pub u64);

impl LocalityKey {
    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn from_be_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 8] = bytes.try_into().map_err(|_| {
            AtomError::Integrity(format!("locality key must be 8 bytes, found {}", bytes.len()))
        })?;
        Ok(LocalityKey(u64::from_be_bytes(arr)))
    }
}

/// Projection of one embedding vector into the low-dimensional search space.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpatialKey {
    pub coords: Vec<f64>,
    pub locality: LocalityKey,
    pub partition_id: u32,
    pub landmark_version: u32,
    pub partition_version: u32,
}

/// One ranked query hit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub atom_id: AtomId,
    /// Exact cosine similarity against the full-precision vector.
    pub score: f64,
}
