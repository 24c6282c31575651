use rusqlite::ErrorCode;
use thiserror::Error;

use crate::credentials::CredentialError;
use crate::storage::StorageError;

/// Errors surfaced by the intake, review and governance operations.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Missing or malformed input, or a guard that refused the request.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The caller acted on a stale snapshot and must refetch before retrying.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The document exists but its stored file was deleted.
    #[error("stored file for document {0} was purged")]
    Purged(String),

    #[error("transient I/O failure: {0}")]
    TransientIo(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("credential error: {0}")]
    Credential(#[from] CredentialError),
}

pub type Result<T> = std::result::Result<T, WorkflowError>;

impl WorkflowError {
    pub fn validation(msg: impl Into<String>) -> Self {
        WorkflowError::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        WorkflowError::Conflict(msg.into())
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        WorkflowError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        WorkflowError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Validation-class errors are returned to the caller and never retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            WorkflowError::Validation(_) | WorkflowError::InvalidTransition { .. }
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, WorkflowError::Conflict(_))
    }

    /// Only read-only callers may retry on these.
    pub fn is_transient(&self) -> bool {
        match self {
            WorkflowError::TransientIo(_) => true,
            WorkflowError::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

impl From<StorageError> for WorkflowError {
    fn from(err: StorageError) -> Self {
        WorkflowError::TransientIo(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_transition_is_a_validation_error() {
        let err = WorkflowError::invalid_transition("PENDING", "APPROVED");
        assert!(err.is_validation());
        assert!(!err.is_transient());
        assert_eq!(err.to_string(), "invalid transition from PENDING to APPROVED");
    }

    #[test]
    fn busy_database_is_transient() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(WorkflowError::from(busy).is_transient());
        assert!(WorkflowError::TransientIo("socket reset".into()).is_transient());
        assert!(!WorkflowError::conflict("stale").is_transient());
    }
}
