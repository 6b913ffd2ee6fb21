//! Error types for the Whisper mesh core

use thiserror::Error;

/// Coarse classification of a [`MeshError`].
///
/// Lower layers return typed errors; callers use the category to decide
/// whether to surface the failure or degrade and carry on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed packet, envelope or persisted record
    Structural,
    /// Integrity tag mismatch
    Authentication,
    /// Persistence or transport unavailable
    Resource,
    /// Caller misuse (negative ttl, missing identity)
    Programming,
}

/// Main error type for Whisper mesh operations
#[derive(Error, Debug)]
pub enum MeshError {
    /// Packet or envelope could not be decoded or is missing a field
    #[error("Malformed data: {0}")]
    Malformed(String),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Integrity tag did not match; no plaintext is returned
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Stored key material failed validation on load
    #[error("Key material corrupted: {0}")]
    KeyCorrupted(String),

    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Time-to-live must be non-negative
    #[error("Invalid ttl {0}: hop budget must be non-negative")]
    InvalidTtl(i64),

    /// Local identity was needed before it was created
    #[error("Local identity has not been initialized")]
    MissingIdentity,

    /// Handshake frame did not carry the expected protocol tag
    #[error("Handshake rejected: {0}")]
    Handshake(String),

    /// Key/value persistence failed or timed out
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Link-layer send failed or timed out
    #[error("Transport error: {0}")]
    Transport(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MeshError {
    /// Classify this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            MeshError::Malformed(_)
            | MeshError::Serialization(_)
            | MeshError::Handshake(_)
            | MeshError::KeyCorrupted(_)
            | MeshError::Crypto(_) => ErrorCategory::Structural,
            MeshError::AuthenticationFailed(_) => ErrorCategory::Authentication,
            MeshError::InvalidTtl(_) | MeshError::MissingIdentity => ErrorCategory::Programming,
            MeshError::Persistence(_)
            | MeshError::Transport(_)
            | MeshError::Database(_)
            | MeshError::Transaction(_)
            | MeshError::Table(_)
            | MeshError::StorageOp(_)
            | MeshError::Commit(_)
            | MeshError::Io(_) => ErrorCategory::Resource,
        }
    }

    /// True for failures that should degrade rather than abort.
    pub fn is_resource(&self) -> bool {
        self.category() == ErrorCategory::Resource
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::Serialization(err.to_string())
    }
}

/// Result type alias using MeshError
pub type MeshResult<T> = Result<T, MeshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MeshError::InvalidTtl(-1);
        assert_eq!(
            format!("{}", err),
            "Invalid ttl -1: hop budget must be non-negative"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: MeshError = io_err.into();
        assert!(matches!(err, MeshError::Io(_)));
        assert!(err.is_resource());
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            MeshError::AuthenticationFailed("tag".into()).category(),
            ErrorCategory::Authentication
        );
        assert_eq!(
            MeshError::Malformed("missing id".into()).category(),
            ErrorCategory::Structural
        );
        assert_eq!(MeshError::MissingIdentity.category(), ErrorCategory::Programming);
        assert_eq!(
            MeshError::Transport("link down".into()).category(),
            ErrorCategory::Resource
        );
    }

    #[test]
    fn test_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: MeshError = json_err.into();
        assert!(matches!(err, MeshError::Serialization(_)));
        assert_eq!(err.category(), ErrorCategory::Structural);
    }
}
