//! Error types for store operations.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No live document (or attachment) exists under the given id.
    #[error("not found: {id}")]
    NotFound {
        /// The document id, or `"{doc id}/{attachment name}"` for attachments.
        id: String,
    },

    /// The supplied revision does not match the stored one.
    #[error("document update conflict on {id}")]
    Conflict {
        /// The conflicting document id.
        id: String,
    },

    /// A stub attachment was written without a matching stored body.
    #[error("missing attachment body for stub {name} on {id}")]
    MissingStub {
        /// The document id.
        id: String,
        /// The attachment name.
        name: String,
    },

    /// The document is malformed (empty id, bad attachment entry).
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    /// The store has been closed.
    #[error("store is closed")]
    Closed,
}

impl StoreError {
    /// Creates a not-found error.
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Creates a conflict error.
    pub fn conflict(id: impl Into<String>) -> Self {
        Self::Conflict { id: id.into() }
    }

    /// Creates an invalid document error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidDocument(message.into())
    }

    /// Returns true for a lost optimistic-revision race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        assert_eq!(
            StoreError::not_found("todo::1").to_string(),
            "not found: todo::1"
        );
        assert!(StoreError::conflict("todo::1").to_string().contains("todo::1"));
        assert!(StoreError::conflict("x").is_conflict());
        assert!(!StoreError::Closed.is_conflict());
    }
}
