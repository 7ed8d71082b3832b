//! Typed errors for the ingestion pipeline.
//!
//! Uses `thiserror` for library errors (not `anyhow`) to provide
//! strongly-typed, composable error handling. Validation and conflict
//! errors carry a machine-readable reason so operators can distinguish
//! "bad request" from "state already changed by someone else".

use thiserror::Error;

/// Errors that can occur during pipeline operations.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Malformed or policy-disallowed input, rejected before any mutation
    #[error("validation failed: {reason}")]
    Validation { reason: String },

    /// Transition not permitted by the current state, or a structural
    /// merge conflict. No mutation was applied.
    #[error("conflict: {reason}")]
    Conflict { reason: String },

    /// Unknown entity id
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Datastore unavailable or failed; surfaced to the caller, retry is
    /// the caller's responsibility
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// JSON parsing error
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),
}

impl IngestError {
    pub fn validation(reason: impl Into<String>) -> Self {
        IngestError::Validation {
            reason: reason.into(),
        }
    }

    pub fn conflict(reason: impl Into<String>) -> Self {
        IngestError::Conflict {
            reason: reason.into(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        IngestError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Whether this error is a state conflict (as opposed to bad input).
    pub fn is_conflict(&self) -> bool {
        matches!(self, IngestError::Conflict { .. })
    }
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, IngestError>;
