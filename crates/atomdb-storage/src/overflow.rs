//! Inline/overflow encoding of atom values.
//!
//! Values up to the inline threshold live in the atom row. Longer values are
//! addressed by a composite key (fingerprint + leading content bytes) and
//! stored once in the blob table; the atom row keeps only the key and the
//! prefix. Decoding verifies length, prefix and hash so a corrupted record is
//! reported rather than returned.

use atomdb_core::config::StoreConfig;
use atomdb_core::error::{AtomError, Result};
use atomdb_core::types::{Fingerprint, StoredValue};

/// Splits values between inline storage and the blob store.
#[derive(Debug, Clone, Copy)]
pub struct OverflowCodec {
    inline_threshold: usize,
    prefix_len: usize,
}

impl OverflowCodec {
    pub fn new(inline_threshold: usize, prefix_len: usize) -> Self {
        Self {
            inline_threshold,
            prefix_len: prefix_len.max(1),
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(config.inline_threshold, config.prefix_len)
    }

    pub fn inline_threshold(&self) -> usize {
        self.inline_threshold
    }

    /// Whether `len` bytes take the overflow path.
    pub fn overflows(&self, len: usize) -> bool {
        len > self.inline_threshold
    }

    /// Composite blob key for overflow content.
    pub fn overflow_key(&self, fingerprint: &Fingerprint, content: &[u8]) -> String {
        let prefix = &content[..self.prefix_len.min(content.len())];
        format!("{}:{}", fingerprint.to_hex(), hex::encode(prefix))
    }

    /// Encode content for the atom row.
    ///
    /// For overflow values the caller must also persist `content` in the blob
    /// store under the returned key.
    pub fn encode(&self, fingerprint: &Fingerprint, content: &[u8]) -> StoredValue {
        if !self.overflows(content.len()) {
            return StoredValue::Inline(content.to_vec());
        }
        StoredValue::Overflow {
            key: self.overflow_key(fingerprint, content),
            prefix: content[..self.prefix_len.min(content.len())].to_vec(),
        }
    }

    /// Reconstruct the original bytes.
    ///
    /// `blob` must be the blob-store content for overflow values and is
    /// ignored for inline values.
    pub fn decode(
        &self,
        fingerprint: &Fingerprint,
        byte_len: u64,
        value: &StoredValue,
        blob: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        let content = match value {
            StoredValue::Inline(bytes) => bytes.as_slice(),
            StoredValue::Overflow { key, prefix } => {
                let blob = blob.ok_or_else(|| {
                    AtomError::Integrity(format!("overflow blob {} is missing", key))
                })?;
                if !blob.starts_with(prefix) {
                    return Err(AtomError::Integrity(format!(
                        "overflow blob {} does not match the recorded prefix",
                        key
                    )));
                }
                blob
            }
        };

        if content.len() as u64 != byte_len {
            return Err(AtomError::Integrity(format!(
                "stored value for {} is {} bytes, expected {}",
                fingerprint,
                content.len(),
                byte_len
            )));
        }
        if Fingerprint::of(content) != *fingerprint {
            return Err(AtomError::Integrity(format!(
                "stored value does not hash to fingerprint {}",
                fingerprint
            )));
        }
        Ok(content.to_vec())
    }

    /// Check that `content` is the value recorded for an existing atom.
    ///
    /// Used when a put lands on an existing fingerprint: a mismatch means two
    /// different byte sequences share one fingerprint. Overflow values are
    /// compared by length and prefix; the full bytes live in the blob store.
    pub fn matches(&self, stored: &StoredValue, stored_len: u64, content: &[u8]) -> bool {
        if stored_len != content.len() as u64 {
            return false;
        }
        match stored {
            StoredValue::Inline(bytes) => bytes.as_slice() == content,
            StoredValue::Overflow { prefix, .. } => content.starts_with(prefix),
        }
    }
}

impl Default for OverflowCodec {
    fn default() -> Self {
        Self::from_config(&StoreConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> OverflowCodec {
        OverflowCodec::new(64, 8)
    }

    #[test]
    fn test_small_values_stay_inline() {
        let content = b"hello";
        let fp = Fingerprint::of(content);
        let value = codec().encode(&fp, content);
        assert_eq!(value, StoredValue::Inline(content.to_vec()));

        let exact = [7u8; 64];
        assert!(!codec().encode(&Fingerprint::of(&exact), &exact).is_overflow());
    }

    #[test]
    fn test_large_values_overflow_with_composite_key() {
        let content: Vec<u8> = (0..100u8).collect();
        let fp = Fingerprint::of(&content);
        match codec().encode(&fp, &content) {
            StoredValue::Overflow { key, prefix } => {
                assert_eq!(prefix, content[..8].to_vec());
                assert!(key.starts_with(&fp.to_hex()));
                assert!(key.ends_with(&hex::encode(&content[..8])));
            }
            other => panic!("expected overflow, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_roundtrip_overflow() {
        let content: Vec<u8> = (0..100u8).collect();
        let fp = Fingerprint::of(&content);
        let value = codec().encode(&fp, &content);
        let decoded = codec()
            .decode(&fp, content.len() as u64, &value, Some(&content))
            .unwrap();
        assert_eq!(decoded, content);
    }

    #[test]
    fn test_decode_detects_corrupted_blob() {
        let content: Vec<u8> = (0..100u8).collect();
        let fp = Fingerprint::of(&content);
        let value = codec().encode(&fp, &content);

        let mut corrupted = content.clone();
        corrupted[50] ^= 0xff;
        let err = codec()
            .decode(&fp, content.len() as u64, &value, Some(&corrupted))
            .unwrap_err();
        assert!(err.is_integrity());

        let err = codec()
            .decode(&fp, content.len() as u64, &value, None)
            .unwrap_err();
        assert!(err.is_integrity());

        let truncated = &content[..90];
        let err = codec()
            .decode(&fp, content.len() as u64, &value, Some(truncated))
            .unwrap_err();
        assert!(err.is_integrity());
    }

    #[test]
    fn test_decode_detects_corrupted_inline() {
        let fp = Fingerprint::of(b"hello");
        let value = StoredValue::Inline(b"jello".to_vec());
        assert!(codec().decode(&fp, 5, &value, None).unwrap_err().is_integrity());
    }

    #[test]
    fn test_matches() {
        let content: Vec<u8> = (0..100u8).collect();
        let fp = Fingerprint::of(&content);
        let value = codec().encode(&fp, &content);
        assert!(codec().matches(&value, 100, &content));

        let mut other = content.clone();
        other[0] = 255;
        assert!(!codec().matches(&value, 100, &other));
        assert!(!codec().matches(&value, 99, &content[..99]));

        let inline = StoredValue::Inline(b"abc".to_vec());
        assert!(codec().matches(&inline, 3, b"abc"));
        assert!(!codec().matches(&inline, 3, b"abd"));
    }
}
