//! Error types for the snapshot and layer pipeline.
//!
//! A single enum covers every module. Callers that need to branch on the
//! kind of failure (rather than its message) use the classification
//! helpers: [`Error::is_not_found`], [`Error::is_already_exists`] and
//! [`Error::is_failed_precondition`]. The rootfs pipeline depends on these
//! to decide when to retry, recurse, or treat a race as success.

use std::path::PathBuf;

/// Result type alias for snapshot and layer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the snapshot and layer pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Digest / Media Type Errors
    // =========================================================================
    /// Digest string could not be parsed.
    #[error("invalid digest '{digest}': {reason}")]
    InvalidDigest { digest: String, reason: String },

    /// Content hash did not match the expected digest.
    #[error("digest mismatch: expected {expected}, computed {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// Media type is not a layer type or is otherwise unsupported.
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    // =========================================================================
    // Content Store Errors
    // =========================================================================
    /// Storage initialization failed.
    #[error("failed to initialize storage at {path}: {reason}")]
    StorageInitFailed { path: PathBuf, reason: String },

    /// Blob not found in storage.
    #[error("blob not found: {digest}")]
    BlobNotFound { digest: String },

    /// Storage write failed.
    #[error("failed to write to storage: {0}")]
    StorageWriteFailed(String),

    /// Another writer holds the ingest reference.
    #[error("ingest reference '{reference}' is locked by another writer")]
    ContentLocked { reference: String },

    /// Committed size did not match the expected size.
    #[error("unexpected commit size: expected {expected}, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    // =========================================================================
    // Snapshot Errors
    // =========================================================================
    /// Snapshot key does not exist.
    #[error("snapshot {0} does not exist")]
    SnapshotNotFound(String),

    /// Snapshot key is already in use.
    #[error("snapshot {0} already exists")]
    SnapshotAlreadyExists(String),

    /// Operation is not valid in the snapshot's current state.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    // =========================================================================
    // Layer Errors
    // =========================================================================
    /// Layer extraction failed.
    #[error("failed to extract layer {digest}: {reason}")]
    LayerExtractionFailed { digest: String, reason: String },

    /// Applied layer produced a different diff ID than advertised.
    #[error("wrong diff id calculated on extraction: expected {expected}, got {actual}")]
    WrongDiffId { expected: String, actual: String },

    /// Layer or rootfs size exceeded limits.
    #[error("size limit exceeded: {size} > {limit}")]
    SizeLimitExceeded { size: u64, limit: u64 },

    /// Path traversal attempt detected in tar archive.
    #[error("path traversal detected in layer: {path}")]
    PathTraversal { path: String },

    /// Diff computation failed.
    #[error("failed to compute diff: {0}")]
    DiffFailed(String),

    // =========================================================================
    // Truncated Index Errors
    // =========================================================================
    /// Empty id or prefix.
    #[error("prefix can't be empty")]
    EmptyPrefix,

    /// Id contains a character that cannot be indexed.
    #[error("illegal character: '{0}'")]
    IllegalIdChar(char),

    /// Id already present in the index.
    #[error("id already exists: {0}")]
    IdAlreadyExists(String),

    /// No id matches.
    #[error("no such id: {0}")]
    IdNotFound(String),

    /// More than one id matches the prefix.
    #[error("multiple ids found with provided prefix: {0}")]
    AmbiguousPrefix(String),

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// Service has been shut down.
    #[error("shutdown")]
    Shutdown,

    /// A shutdown callback failed.
    #[error("shutdown callback failed: {0}")]
    ShutdownCallback(String),

    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(String),

    /// Registry credentials are malformed.
    #[error("invalid credentials for {host}: {reason}")]
    InvalidCredentials { host: String, reason: String },

    /// Operation not supported.
    #[error("operation not supported: {0}")]
    NotSupported(String),

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true for any "does not exist" condition.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::SnapshotNotFound(_) | Self::BlobNotFound { .. } | Self::IdNotFound(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Returns true for any "already exists" condition.
    pub fn is_already_exists(&self) -> bool {
        match self {
            Self::SnapshotAlreadyExists(_) | Self::IdAlreadyExists(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::AlreadyExists,
            _ => false,
        }
    }

    /// Returns true when the target is in the wrong state for the operation.
    pub fn is_failed_precondition(&self) -> bool {
        matches!(self, Self::FailedPrecondition(_) | Self::ContentLocked { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
