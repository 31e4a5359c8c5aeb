//! Error taxonomy for provenant operations.
//! Integrity and not-found errors are always returned to the caller, never swallowed.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Main error type for provenant operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProvenanceError {
    /// A recomputed hash does not match a stored hash
    IntegrityViolation {
        operation: String,
        subject: String,
        expected: String,
        actual: String,
    },
    /// No blob or record exists for the requested key
    NotFound {
        operation: String,
        key: String,
    },
    /// A capsule references a digest that the CAS does not hold
    MissingBlob {
        capsule_id: String,
        digest: String,
    },
    /// Underlying storage I/O failure
    WriteFailure {
        operation: String,
        path: Option<String>,
        source: String,
    },
    /// Archive container is unreadable or structurally broken
    CorruptArchive {
        path: String,
        reason: String,
    },
    /// Caller supplied something the core cannot accept
    InvalidInput {
        operation: String,
        reason: String,
    },
    /// Encoding or decoding of a structured record failed
    Serialization {
        operation: String,
        source: String,
    },
    /// Configuration errors
    Config {
        field: Option<String>,
        source: String,
    },
}

impl fmt::Display for ProvenanceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvenanceError::IntegrityViolation { operation, subject, expected, actual } => {
                write!(
                    f,
                    "Integrity violation in {}: {} (expected: {}, actual: {})",
                    operation, subject, expected, actual
                )
            }
            ProvenanceError::NotFound { operation, key } => {
                write!(f, "Not found in {}: {}", operation, key)
            }
            ProvenanceError::MissingBlob { capsule_id, digest } => {
                write!(f, "Missing blob {} referenced by capsule {}", digest, capsule_id)
            }
            ProvenanceError::WriteFailure { operation, path, source } => {
                write!(f, "Storage error in {}: {}", operation, source)?;
                if let Some(path) = path {
                    write!(f, " (path: {})", path)?;
                }
                Ok(())
            }
            ProvenanceError::CorruptArchive { path, reason } => {
                write!(f, "Corrupt archive {}: {}", path, reason)
            }
            ProvenanceError::InvalidInput { operation, reason } => {
                write!(f, "Invalid input to {}: {}", operation, reason)
            }
            ProvenanceError::Serialization { operation, source } => {
                write!(f, "Serialization error in {}: {}", operation, source)
            }
            ProvenanceError::Config { field, source } => {
                write!(f, "Configuration error: {}", source)?;
                if let Some(field) = field {
                    write!(f, " (field: {})", field)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ProvenanceError {}

impl ProvenanceError {
    /// Stable short name for JSON output and ledger `capsule_failed` payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            ProvenanceError::IntegrityViolation { .. } => "integrity_violation",
            ProvenanceError::NotFound { .. } => "not_found",
            ProvenanceError::MissingBlob { .. } => "missing_blob",
            ProvenanceError::WriteFailure { .. } => "write_failure",
            ProvenanceError::CorruptArchive { .. } => "corrupt_archive",
            ProvenanceError::InvalidInput { .. } => "invalid_input",
            ProvenanceError::Serialization { .. } => "serialization",
            ProvenanceError::Config { .. } => "config",
        }
    }

    pub fn is_integrity(&self) -> bool {
        matches!(self, ProvenanceError::IntegrityViolation { .. })
    }
}

pub type Result<T> = std::result::Result<T, ProvenanceError>;

/// Convert std::io::Error to ProvenanceError
pub fn io_error(operation: &str, path: Option<&Path>, source: std::io::Error) -> ProvenanceError {
    ProvenanceError::WriteFailure {
        operation: operation.to_string(),
        path: path.map(|p| p.display().to_string()),
        source: source.to_string(),
    }
}

pub fn serde_error(operation: &str, source: serde_json::Error) -> ProvenanceError {
    ProvenanceError::Serialization {
        operation: operation.to_string(),
        source: source.to_string(),
    }
}

pub fn invalid_input(operation: &str, reason: impl Into<String>) -> ProvenanceError {
    ProvenanceError::InvalidInput {
        operation: operation.to_string(),
        reason: reason.into(),
    }
}

pub fn not_found(operation: &str, key: impl Into<String>) -> ProvenanceError {
    ProvenanceError::NotFound {
        operation: operation.to_string(),
        key: key.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = io_error(
            "cas_put",
            Some(Path::new("/path/to/blob")),
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "Permission denied"),
        );

        let display = format!("{}", error);
        assert!(display.contains("cas_put"));
        assert!(display.contains("Permission denied"));
        assert!(display.contains("/path/to/blob"));
    }

    #[test]
    fn test_integrity_display_names_both_hashes() {
        let error = ProvenanceError::IntegrityViolation {
            operation: "cas_get".to_string(),
            subject: "blob".to_string(),
            expected: "aa".to_string(),
            actual: "bb".to_string(),
        };
        let display = error.to_string();
        assert!(display.contains("expected: aa"));
        assert!(display.contains("actual: bb"));
        assert!(error.is_integrity());
        assert_eq!(error.kind(), "integrity_violation");
    }

    #[test]
    fn test_error_serializes_for_json_output() {
        let error = not_found("verify_capsule", "CAP-9");
        let json = serde_json::to_string(&error).unwrap();
        assert!(json.contains("NotFound"));
        assert!(json.contains("CAP-9"));
    }
}
