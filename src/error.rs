//! Error taxonomy for the OCR-and-push pipeline.
//!
//! The queue retries transient errors up to a configured bound, so every
//! variant must know whether retrying could plausibly help. By default we
//! treat errors as fatal until they've been observed in the wild and
//! determined to be transient; this prevents long retry loops on errors
//! that will never resolve.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors produced while resolving, OCRing, or pushing a document.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The resolved path does not exist on any mounted storage root.
    #[error("file not found: {path}")]
    FileNotFound { path: PathBuf },

    /// The OCR provider failed or was unreachable.
    #[error("OCR provider {provider} failed: {message}")]
    Provider { provider: String, message: String },

    /// The file's format is not something the OCR provider can handle.
    #[error("unsupported format {mime_type} for {path}")]
    UnsupportedFormat { path: PathBuf, mime_type: String },

    /// A network call exceeded its bounded timeout.
    #[error("timed out after {timeout:?} during {phase}")]
    Timeout { phase: &'static str, timeout: Duration },

    /// The file upload failed. Object creation must not proceed.
    #[error("file upload failed: {message}")]
    Upload { message: String },

    /// Object creation failed *after* a successful upload, leaving an
    /// orphaned file entity in the repository. Reported distinctly so
    /// operators can reconcile the orphan; we never delete it ourselves.
    #[error("object creation failed, leaving orphaned file {orphaned_file}: {message}")]
    ObjectCreate { orphaned_file: i64, message: String },

    /// A node-first push created the object but the follow-up upload failed.
    /// The object's file reference is left in its unresolved tagged state.
    #[error("object {object_id} created but file upload failed; attachment left unresolved")]
    UnresolvedAttachment { object_id: i64 },

    /// A repository call failed at the HTTP level (lookup, session token).
    #[error("repository request failed: {0}")]
    Repository(String),

    /// We could not obtain or refresh a session token.
    #[error("repository authentication failed: {0}")]
    Auth(String),

    /// Cancellation was requested for this task between phases.
    #[error("task cancelled")]
    Cancelled,

    /// The task queue's backing store failed.
    #[error("task queue error: {0}")]
    Queue(#[from] sqlx::Error),

    /// An internal invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Is this error likely to resolve on a retry?
    pub fn is_transient(&self) -> bool {
        match self {
            RelayError::Provider { .. }
            | RelayError::Timeout { .. }
            | RelayError::Upload { .. }
            | RelayError::ObjectCreate { .. }
            | RelayError::Auth(_)
            | RelayError::Queue(_) => true,
            RelayError::FileNotFound { .. }
            | RelayError::UnsupportedFormat { .. }
            | RelayError::UnresolvedAttachment { .. }
            | RelayError::Cancelled
            | RelayError::Internal(_) => false,
            // HTTP-level lookup failures are usually load or network related.
            RelayError::Repository(_) => true,
        }
    }

    /// A short stable name for this error, recorded with dead-lettered tasks.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::FileNotFound { .. } => "file_not_found",
            RelayError::Provider { .. } => "provider",
            RelayError::UnsupportedFormat { .. } => "unsupported_format",
            RelayError::Timeout { .. } => "timeout",
            RelayError::Upload { .. } => "upload",
            RelayError::ObjectCreate { .. } => "object_create",
            RelayError::UnresolvedAttachment { .. } => "unresolved_attachment",
            RelayError::Repository(_) => "repository",
            RelayError::Auth(_) => "auth",
            RelayError::Cancelled => "cancelled",
            RelayError::Queue(_) => "queue",
            RelayError::Internal(_) => "internal",
        }
    }
}

/// Convenience alias for pipeline results.
pub type RelayResult<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_errors_are_transient() {
        let err = RelayError::Upload {
            message: "connection reset".to_owned(),
        };
        assert!(err.is_transient());
        assert_eq!(err.kind(), "upload");
    }

    #[test]
    fn file_not_found_is_fatal() {
        let err = RelayError::FileNotFound {
            path: PathBuf::from("/data/missing.pdf"),
        };
        assert!(!err.is_transient());
    }

    #[test]
    fn object_create_reports_the_orphan() {
        let err = RelayError::ObjectCreate {
            orphaned_file: 456,
            message: "503".to_owned(),
        };
        assert!(err.is_transient());
        assert!(err.to_string().contains("orphaned file 456"));
    }
}
