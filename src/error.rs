//! Error types for the research-kb storage and query layers.
//!
//! Store-layer failures are wrapped in [`KbError`] with enough context
//! (operation, entity, key) for callers to log and decide. The CLI layer
//! converts these into `anyhow` reports at the boundary.

use thiserror::Error;

/// Result type alias used throughout the library.
pub type Result<T> = std::result::Result<T, KbError>;

/// Error hierarchy for storage, search, and validation failures.
///
/// Duplicate-key conflicts on idempotent paths (re-ingesting a known file
/// hash, re-inserting an existing relationship edge) are handled by the
/// stores themselves via lookup-and-return or insert-or-ignore; `Duplicate`
/// only surfaces from the strict `create` variants.
#[derive(Debug, Error)]
pub enum KbError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("metadata encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{entity} with {key} '{value}' already exists")]
    Duplicate {
        entity: &'static str,
        key: &'static str,
        value: String,
    },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("search failed: {0}")]
    Search(String),
}

impl KbError {
    /// True when the error is a unique-constraint conflict mapped by a store.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, KbError::Duplicate { .. })
    }
}

/// Check whether a raw sqlx error is a unique-constraint violation.
///
/// Used by stores to translate constraint conflicts into [`KbError::Duplicate`]
/// instead of leaking driver-level errors.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_message_carries_context() {
        let err = KbError::Duplicate {
            entity: "source",
            key: "file_hash",
            value: "abc123".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("source"));
        assert!(msg.contains("file_hash"));
        assert!(msg.contains("abc123"));
        assert!(err.is_duplicate());
    }

    #[test]
    fn test_not_found_is_not_duplicate() {
        let err = KbError::NotFound {
            entity: "concept",
            id: "xyz".to_string(),
        };
        assert!(!err.is_duplicate());
    }
}
