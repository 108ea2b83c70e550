// Error taxonomy for the code graph service
// Every failure that crosses a subsystem boundary is one of these variants.
// The MCP layer maps variants to stable error codes; the CLI maps the fatal
// ones to process exit codes.

use std::path::PathBuf;
use thiserror::Error;

/// Process exit codes for fatal startup/shutdown conditions.
pub mod exit_codes {
    pub const OK: i32 = 0;
    pub const STORAGE_ERROR: i32 = 2;
    pub const SCHEMA_TOO_NEW: i32 = 3;
    pub const RESOURCE_EXHAUSTED: i32 = 4;
}

#[derive(Debug, Error)]
pub enum CodeGraphError {
    // Input errors: surfaced to the caller, never retried.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("entity not found: {0}")]
    EntityNotFound(String),

    #[error("ambiguous name '{name}' matches {count} entities")]
    AmbiguousName { name: String, count: usize },

    // Parse errors: recorded with file context, the file is skipped.
    #[error("file too large: {path} is {size} bytes (limit {limit})")]
    FileTooLarge {
        path: PathBuf,
        size: u64,
        limit: u64,
    },

    #[error("parse timed out for {0}")]
    ParseTimeout(PathBuf),

    #[error("parse failed for {path}: {reason}")]
    ParseFailed { path: PathBuf, reason: String },

    // Resource errors: retried with backoff up to a bound, then surfaced.
    #[error("resources exhausted: {0}")]
    ResourceExhausted(String),

    #[error("{operation} timed out after {ms} ms")]
    Timeout { operation: String, ms: u64 },

    #[error("task queue is full")]
    QueueFull,

    #[error("operation cancelled")]
    Cancelled,

    // Storage errors.
    #[error("storage corrupted: {0}")]
    StorageCorrupted(String),

    #[error("store schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: u32, supported: u32 },

    #[error("store is poisoned by an earlier write failure; restart required")]
    StorePoisoned,

    // Vector errors: the structural path is unaffected.
    #[error("embedding failed: {0}")]
    EmbeddingFailed(String),

    // Logic errors: internal invariant violations.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CodeGraphError {
    /// Stable, client-visible error code for this variant.
    pub fn code(&self) -> &'static str {
        match self {
            CodeGraphError::InvalidPath(_) => "INVALID_PATH",
            CodeGraphError::FileNotFound(_) => "FILE_NOT_FOUND",
            CodeGraphError::UnsupportedLanguage(_) => "UNSUPPORTED_LANGUAGE",
            CodeGraphError::InvalidArgument(_) => "INVALID_ARGUMENT",
            CodeGraphError::EntityNotFound(_) => "ENTITY_NOT_FOUND",
            CodeGraphError::AmbiguousName { .. } => "AMBIGUOUS_NAME",
            CodeGraphError::FileTooLarge { .. } => "FILE_TOO_LARGE",
            CodeGraphError::ParseTimeout(_) => "PARSE_TIMEOUT",
            CodeGraphError::ParseFailed { .. } => "PARSE_FAILED",
            CodeGraphError::ResourceExhausted(_) => "RESOURCE_EXHAUSTED",
            CodeGraphError::Timeout { .. } => "TIMEOUT",
            CodeGraphError::QueueFull => "QUEUE_FULL",
            CodeGraphError::Cancelled => "CANCELLED",
            CodeGraphError::StorageCorrupted(_) => "STORAGE_CORRUPTED",
            CodeGraphError::SchemaTooNew { .. } => "SCHEMA_TOO_NEW",
            CodeGraphError::StorePoisoned => "STORE_POISONED",
            CodeGraphError::EmbeddingFailed(_) => "EMBEDDING_FAILED",
            CodeGraphError::Internal(_) => "INTERNAL",
        }
    }

    /// Whether a bounded retry with backoff is appropriate.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CodeGraphError::ResourceExhausted(_)
                | CodeGraphError::Timeout { .. }
                | CodeGraphError::QueueFull
                | CodeGraphError::EmbeddingFailed(_)
        )
    }

    /// Exit code when this error aborts the process at startup.
    pub fn exit_code(&self) -> i32 {
        match self {
            CodeGraphError::SchemaTooNew { .. } => exit_codes::SCHEMA_TOO_NEW,
            CodeGraphError::ResourceExhausted(_) => exit_codes::RESOURCE_EXHAUSTED,
            CodeGraphError::StorageCorrupted(_) | CodeGraphError::StorePoisoned => {
                exit_codes::STORAGE_ERROR
            }
            _ => 1,
        }
    }
}

/// Extract the typed error from an `anyhow` chain, if there is one.
pub fn as_codegraph_error(err: &anyhow::Error) -> Option<&CodeGraphError> {
    err.downcast_ref::<CodeGraphError>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            CodeGraphError::UnsupportedLanguage("cobol".into()).code(),
            "UNSUPPORTED_LANGUAGE"
        );
        assert_eq!(
            CodeGraphError::SchemaTooNew {
                found: 9,
                supported: 3
            }
            .code(),
            "SCHEMA_TOO_NEW"
        );
    }

    #[test]
    fn exit_codes_match_contract() {
        assert_eq!(
            CodeGraphError::SchemaTooNew {
                found: 9,
                supported: 3
            }
            .exit_code(),
            3
        );
        assert_eq!(
            CodeGraphError::StorageCorrupted("bad header".into()).exit_code(),
            2
        );
        assert_eq!(
            CodeGraphError::ResourceExhausted("memory".into()).exit_code(),
            4
        );
    }

    #[test]
    fn retryable_classification() {
        assert!(CodeGraphError::QueueFull.is_retryable());
        assert!(!CodeGraphError::InvalidPath("..".into()).is_retryable());
    }

    #[test]
    fn downcast_from_anyhow() {
        let err: anyhow::Error = CodeGraphError::Cancelled.into();
        assert_eq!(as_codegraph_error(&err).unwrap().code(), "CANCELLED");
    }
}
