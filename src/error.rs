//! Error types for storyrelay
//!
//! This module defines the failure taxonomy shared by the upstream reader,
//! the session coordinator, the document store, and the outer surfaces,
//! using `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Main error type for relay operations
///
/// Every fatal session outcome maps onto exactly one variant. A malformed
/// upstream record is deliberately absent: it is logged and skipped, never
/// raised.
#[derive(Error, Debug)]
pub enum RelayError {
    /// The provider could not be reached or the connection dropped
    #[error("Connection error: {0}")]
    Connection(String),

    /// The provider reported an explicit error record
    #[error("Provider error: {0}")]
    Provider(String),

    /// The overall session deadline elapsed
    #[error("Generation timed out after {0}s")]
    Timeout(u64),

    /// A session is already active for the same chapter
    #[error(
        "Generation already in progress for workspace={workspace_id} project={project_id} \
         chapter={chapter_order} (session {session_id})"
    )]
    Conflict {
        /// Workspace of the active session
        workspace_id: String,
        /// Project of the active session
        project_id: String,
        /// Chapter of the active session
        chapter_order: u32,
        /// Identifier of the session holding the chapter
        session_id: String,
    },

    /// The session was cancelled before it finished
    #[error("Generation cancelled")]
    Cancelled,

    /// The generation request failed validation
    #[error("Invalid generation request: {0}")]
    InvalidRequest(String),

    /// A manual edit was made against a stale document version
    #[error("Document version conflict: expected={expected}, actual={actual}")]
    VersionConflict {
        /// Version the editor based the change on
        expected: u64,
        /// Version currently stored
        actual: u64,
    },

    /// The project has no stored document
    #[error("Document not found for project: {0}")]
    DocumentNotFound(String),

    /// A document already exists for the project
    #[error("Document already exists for project: {0}")]
    DocumentExists(String),

    /// The document has no chapter with the given order
    #[error("Chapter {chapter_order} not found in project {project_id}")]
    ChapterNotFound {
        /// Project that was searched
        project_id: String,
        /// Chapter order that was requested
        chapter_order: u32,
    },

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Document or audit storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Embedded database errors
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),
}

impl RelayError {
    /// Short, stable label for logs, metrics, and audit records
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Connection(_) => "connection",
            RelayError::Provider(_) => "provider",
            RelayError::Timeout(_) => "timeout",
            RelayError::Conflict { .. } => "conflict",
            RelayError::Cancelled => "cancelled",
            RelayError::InvalidRequest(_) => "invalid_request",
            RelayError::VersionConflict { .. } => "version_conflict",
            RelayError::DocumentNotFound(_) => "document_not_found",
            RelayError::DocumentExists(_) => "document_exists",
            RelayError::ChapterNotFound { .. } => "chapter_not_found",
            RelayError::Config(_) => "config",
            RelayError::Storage(_) => "storage",
            RelayError::Io(_) => "io",
            RelayError::Serialization(_) => "serialization",
            RelayError::Yaml(_) => "yaml",
            RelayError::Database(_) => "database",
        }
    }
}

/// Result type alias for relay operations
///
/// Uses `anyhow::Error` so callers can attach context while still being
/// able to `downcast_ref::<RelayError>()` when the category matters.
pub type Result<T> = anyhow::Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_display() {
        let error = RelayError::Connection("connection refused".to_string());
        assert_eq!(error.to_string(), "Connection error: connection refused");
    }

    #[test]
    fn test_provider_error_display() {
        let error = RelayError::Provider("quota exceeded".to_string());
        assert_eq!(error.to_string(), "Provider error: quota exceeded");
    }

    #[test]
    fn test_timeout_error_display() {
        let error = RelayError::Timeout(180);
        assert_eq!(error.to_string(), "Generation timed out after 180s");
    }

    #[test]
    fn test_conflict_error_display() {
        let error = RelayError::Conflict {
            workspace_id: "ws".to_string(),
            project_id: "p1".to_string(),
            chapter_order: 2,
            session_id: "01HZX".to_string(),
        };
        let s = error.to_string();
        assert!(s.contains("chapter=2"));
        assert!(s.contains("01HZX"));
    }

    #[test]
    fn test_version_conflict_display() {
        let error = RelayError::VersionConflict {
            expected: 3,
            actual: 5,
        };
        assert_eq!(
            error.to_string(),
            "Document version conflict: expected=3, actual=5"
        );
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(RelayError::Cancelled.kind(), "cancelled");
        assert_eq!(RelayError::Timeout(1).kind(), "timeout");
        assert_eq!(RelayError::Provider("x".into()).kind(), "provider");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: RelayError = io_error.into();
        assert!(matches!(error, RelayError::Io(_)));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_error = serde_json::from_str::<serde_json::Value>("{invalid json}").unwrap_err();
        let error: RelayError = json_error.into();
        assert!(matches!(error, RelayError::Serialization(_)));
    }

    #[test]
    fn test_downcast_through_anyhow() {
        let err: anyhow::Error = RelayError::Cancelled.into();
        assert!(matches!(
            err.downcast_ref::<RelayError>(),
            Some(RelayError::Cancelled)
        ));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RelayError>();
    }
}
