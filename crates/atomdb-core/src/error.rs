use thiserror::Error;

/// Top-level error type for atomdb.
///
/// Variants follow the failure taxonomy of the store: validation and
/// integrity failures propagate to the caller, concurrency conflicts are
/// retried inside the store before surfacing, and index/resource conditions
/// are folded into query result envelopes rather than returned.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AtomError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Integrity violation: {0}")]
    Integrity(String),

    #[error("Concurrency conflict persisted after {attempts} attempt(s)")]
    ConcurrencyConflict { attempts: u32 },

    #[error("Index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AtomError {
    /// Whether the operation may succeed if simply attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AtomError::ConcurrencyConflict { .. })
    }

    /// Whether the error indicates corrupted or colliding content.
    pub fn is_integrity(&self) -> bool {
        matches!(self, AtomError::Integrity(_))
    }
}

impl From<toml::de::Error> for AtomError {
    fn from(err: toml::de::Error) -> Self {
        AtomError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for AtomError {
    fn from(err: toml::ser::Error) -> Self {
        AtomError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for AtomError {
    fn from(err: serde_json::Error) -> Self {
        AtomError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for atomdb operations.
pub type Result<T> = std::result::Result<T, AtomError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AtomError::Validation("empty content".to_string());
        assert_eq!(err.to_string(), "Validation error: empty content");

        let err = AtomError::DimensionMismatch {
            expected: 8,
            actual: 3,
        };
        assert_eq!(err.to_string(), "Dimension mismatch: expected 8, got 3");

        let err = AtomError::ConcurrencyConflict { attempts: 5 };
        assert_eq!(
            err.to_string(),
            "Concurrency conflict persisted after 5 attempt(s)"
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(AtomError::ConcurrencyConflict { attempts: 1 }.is_retryable());
        assert!(!AtomError::Integrity("collision".into()).is_retryable());
        assert!(!AtomError::Validation("bad".into()).is_retryable());
        assert!(AtomError::Integrity("collision".into()).is_integrity());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: AtomError = io_err.into();
        assert!(matches!(err, AtomError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_error_from_toml_de() {
        let err: std::result::Result<toml::Value, _> = toml::from_str("invalid = [[[");
        let err: AtomError = err.unwrap_err().into();
        assert!(matches!(err, AtomError::Config(_)));
    }

    #[test]
    fn test_error_from_serde_json() {
        let err: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ nope }");
        let err: AtomError = err.unwrap_err().into();
        assert!(matches!(err, AtomError::Serialization(_)));
    }

    #[test]
    fn test_result_type_with_question_mark() {
        fn inner() -> Result<String> {
            let io_result: std::result::Result<i32, std::io::Error> = Ok(42);
            let value = io_result?;
            Ok(value.to_string())
        }

        assert_eq!(inner().unwrap(), "42");
    }
}
