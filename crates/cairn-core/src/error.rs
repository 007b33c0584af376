use crate::{backend::BackendError, schema::SchemaError};
use thiserror::Error as ThisError;

///
/// StorageError
///
/// Central error type surfaced by every public operation of the engine.
/// Validation and contract violations are raised at the call site without
/// mutating state; backend failures carry the offending key so callers can
/// retry or report.
///

#[derive(Debug, ThisError)]
pub enum StorageError {
    #[error("invalid value at '{path}': {reason}")]
    InvalidValue { path: String, reason: String },

    #[error("unknown attribute '{name}' on class '{class}'")]
    UnknownProperty { class: String, name: String },

    #[error("'{name}' is a reserved attribute name")]
    ReservedProperty { name: String },

    #[error("not found: {key}")]
    NotFound { key: String },

    #[error("already exists: {key}")]
    AlreadyExists { key: String },

    #[error("relation '{relation}' expects class '{expected}', got '{got}'")]
    RelationTypeMismatch {
        relation: String,
        expected: String,
        got: String,
    },

    #[error("backend failure on key '{key}': {source}")]
    BackendFailure {
        key: String,
        #[source]
        source: BackendError,
    },

    #[error("unsupported: {operation}")]
    Unsupported { operation: String },

    #[error("class '{class}' is not registered with a store")]
    NotRegistered { class: String },

    #[error(transparent)]
    Schema(#[from] SchemaError),
}

impl StorageError {
    pub fn invalid_value(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
        }
    }

    /// Wrap a backend error, attaching the key the operation touched.
    pub fn backend(key: impl Into<String>, source: BackendError) -> Self {
        let key = key.into();
        match source {
            BackendError::KeyExists { .. } => Self::AlreadyExists { key },
            source => Self::BackendFailure { key, source },
        }
    }

    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
