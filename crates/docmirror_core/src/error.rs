//! Error types for docmirror core.

use docmirror_store::StoreError;
use std::fmt;
use thiserror::Error;

/// Result type for core operations.
pub type MirrorResult<T> = Result<T, MirrorError>;

/// Boxed error returned by user hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// One schema violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldViolation {
    /// JSON pointer to the offending value (`/title`), empty for the root.
    pub path: String,
    /// JSON pointer into the schema keyword that failed.
    pub schema_path: String,
    /// Human readable description.
    pub message: String,
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "/: {}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

/// A document or property failed schema validation.
///
/// Carries every violation found, not just the first.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct ValidationError {
    violations: Vec<FieldViolation>,
}

impl ValidationError {
    /// Creates a validation error from its violations.
    pub fn new(violations: Vec<FieldViolation>) -> Self {
        Self { violations }
    }

    /// Creates a validation error with a single violation.
    pub fn single(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(vec![FieldViolation {
            path: path.into(),
            schema_path: String::new(),
            message: message.into(),
        }])
    }

    /// Returns every violation.
    pub fn violations(&self) -> &[FieldViolation] {
        &self.violations
    }

    /// Returns true if any violation concerns `field` (by path or message).
    pub fn mentions(&self, field: &str) -> bool {
        self.violations
            .iter()
            .any(|v| v.path.contains(field) || v.message.contains(field))
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "validation failed")?;
        for (i, violation) in self.violations.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{violation}")?;
        }
        Ok(())
    }
}

/// The schema definition cannot back a collection.
///
/// These are programmer errors, raised once at collection construction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    /// The definition is not a valid JSON schema.
    #[error("invalid schema: {message}")]
    Invalid {
        /// Compiler message.
        message: String,
    },

    /// No property is flagged `"primary": true`.
    #[error("schema has no primary field")]
    NoPrimaryField,

    /// More than one property is flagged `"primary": true`.
    #[error("schema has several primary fields: {}", fields.join(", "))]
    MultiplePrimaryFields {
        /// The flagged properties.
        fields: Vec<String>,
    },

    /// The type discriminant has neither a string `const` nor `default`.
    #[error("schema has no type discriminant value for `{field}`")]
    MissingType {
        /// The discriminant property name.
        field: String,
    },
}

impl SchemaError {
    /// Creates an invalid schema error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }
}

/// Errors that can occur in docmirror core operations.
#[derive(Debug, Error)]
pub enum MirrorError {
    /// Schema violation.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Unusable schema definition.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// Store failure, passed through unchanged.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Document could not be decoded into the requested type.
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// No cached item under that key.
    #[error("item not found: {key}")]
    NotFound {
        /// The key that was looked up.
        key: String,
    },

    /// A required name or id was empty.
    #[error("{what} must not be empty")]
    EmptyName {
        /// What was empty.
        what: &'static str,
    },

    /// The document lacks the fields needed to address it.
    #[error("document is missing key field `{field}`")]
    MissingKey {
        /// The missing field.
        field: String,
    },

    /// The item was created by a different collection instance.
    #[error("item belongs to a different collection")]
    ForeignItem,

    /// The item has never been saved.
    #[error("item was never saved")]
    NotPersisted,

    /// The item's collection no longer exists.
    #[error("item is detached from its collection")]
    Detached,

    /// The item has been removed from the store.
    #[error("item has been removed")]
    Removed,

    /// No attachment under that name.
    #[error("attachment not found: {name}")]
    AttachmentNotFound {
        /// The attachment name.
        name: String,
    },

    /// A collection with that name is already registered.
    #[error("collection already exists: {name}")]
    DuplicateCollection {
        /// The collection name.
        name: String,
    },

    /// The before-remove hook refused the removal.
    #[error("removal of {key} rejected by before-remove hook")]
    Vetoed {
        /// Primary key of the item.
        key: String,
    },

    /// The before-remove hook itself failed.
    #[error("before-remove hook failed: {0}")]
    Hook(#[source] BoxError),
}

impl MirrorError {
    /// Creates a not found error.
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Creates a missing key error.
    pub fn missing_key(field: impl Into<String>) -> Self {
        Self::MissingKey {
            field: field.into(),
        }
    }

    /// Creates an attachment not found error.
    pub fn attachment_not_found(name: impl Into<String>) -> Self {
        Self::AttachmentNotFound { name: name.into() }
    }

    /// Returns true if the failure is a precondition the caller can fix
    /// without touching the store.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            MirrorError::NotFound { .. }
                | MirrorError::EmptyName { .. }
                | MirrorError::MissingKey { .. }
                | MirrorError::ForeignItem
                | MirrorError::NotPersisted
                | MirrorError::Detached
                | MirrorError::Removed
                | MirrorError::AttachmentNotFound { .. }
        )
    }
}
