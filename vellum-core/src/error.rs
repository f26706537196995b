//! Error types for Vellum operations

use crate::identity::{DocumentId, ScrollToken};
use std::time::Duration;
use thiserror::Error;

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Document not found: {id}")]
    NotFound { id: DocumentId },

    #[error("Access denied to document {id} for {principal}")]
    AccessDenied { id: DocumentId, principal: String },

    #[error("Document already exists: {id}")]
    AlreadyExists { id: DocumentId },

    #[error("Backend failure: {reason}")]
    Backend { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Incompatible options: {option_a} and {option_b}")]
    IncompatibleOptions { option_a: String, option_b: String },

    #[error("Cluster invalidator not registered: {name}")]
    UnknownInvalidator { name: String },

    #[error("Failed to read config file {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Failed to parse config TOML: {reason}")]
    Parse { reason: String },
}

/// Descendant scroll errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScrollError {
    #[error("Batch size {requested} exceeds the maximum of {max}")]
    BatchSizeExceeded { requested: usize, max: usize },

    #[error("Batch size must be at least 1, got {requested}")]
    InvalidBatchSize { requested: usize },

    #[error("No search context found for scroll token {token}")]
    UnknownScrollToken { token: ScrollToken },

    #[error("Scroll container not found: {container_id}")]
    ContainerNotFound { container_id: DocumentId },

    #[error("Interrupted while waiting for a scroll permit")]
    Interrupted,

    #[error("Timed out after {waited:?} waiting for a scroll permit")]
    PermitTimeout { waited: Duration },

    #[error("Document {document_id} is not a descendant of {container_id}")]
    NotADescendant {
        document_id: DocumentId,
        container_id: DocumentId,
    },

    #[error("Cycle detected in the ancestor chain of {document_id}")]
    AncestorCycle { document_id: DocumentId },
}

/// Cluster invalidation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    #[error("Cluster invalidator used before initialize()")]
    NotInitialized,

    #[error("Failed to send invalidation for {document_id}: {reason}")]
    SendFailed {
        document_id: DocumentId,
        reason: String,
    },

    #[error("Invalidation channel closed")]
    ChannelClosed,
}

/// Master error type for all Vellum errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VellumError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Scroll error: {0}")]
    Scroll(#[from] ScrollError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),
}

impl VellumError {
    /// Visibility failures are recovered locally by skipping the document.
    pub fn is_access_denied(&self) -> bool {
        matches!(self, Self::Storage(StorageError::AccessDenied { .. }))
    }
}

/// Result type alias for Vellum operations.
pub type VellumResult<T> = Result<T, VellumError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_size_exceeded_names_both_values() {
        let err = ScrollError::BatchSizeExceeded {
            requested: 5000,
            max: 1000,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("5000"));
        assert!(msg.contains("1000"));
    }

    #[test]
    fn test_unknown_scroll_token_display() {
        let err = ScrollError::UnknownScrollToken {
            token: ScrollToken::from("abc123"),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("No search context found"));
        assert!(msg.contains("abc123"));
    }

    #[test]
    fn test_storage_error_display_not_found() {
        let err = StorageError::NotFound {
            id: DocumentId::from("doc-9"),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Document not found"));
        assert!(msg.contains("doc-9"));
    }

    #[test]
    fn test_vellum_error_from_variants() {
        let storage = VellumError::from(StorageError::LockPoisoned);
        assert!(matches!(storage, VellumError::Storage(_)));

        let config = VellumError::from(ConfigError::UnknownInvalidator {
            name: "jgroups".to_string(),
        });
        assert!(matches!(config, VellumError::Config(_)));

        let scroll = VellumError::from(ScrollError::Interrupted);
        assert!(matches!(scroll, VellumError::Scroll(_)));

        let cluster = VellumError::from(ClusterError::ChannelClosed);
        assert!(matches!(cluster, VellumError::Cluster(_)));
    }

    #[test]
    fn test_is_access_denied() {
        let denied = VellumError::from(StorageError::AccessDenied {
            id: DocumentId::from("x"),
            principal: "bob".to_string(),
        });
        assert!(denied.is_access_denied());
        assert!(!VellumError::from(StorageError::LockPoisoned).is_access_denied());
    }
}
