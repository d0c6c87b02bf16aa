//! Error types for the change log, its stores, and conflict handling.

use serde_json::Value;
use thiserror::Error;

use crate::conflict::ConflictId;

/// Local durable storage failed.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Store refused the write (quota, read-only media, injected failure).
    #[error("write rejected: {0}")]
    WriteRejected(String),
}

/// Importing an exported change log failed.
#[derive(Error, Debug)]
pub enum ImportError {
    #[error("malformed change log: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unsupported change log version {0}")]
    UnsupportedVersion(u64),
}

/// Errors from the conflict resolver.
#[derive(Error, Debug, PartialEq)]
pub enum ConflictError {
    #[error("conflict not found: {0}")]
    NotFound(ConflictId),

    #[error("conflict {0} has no field {1:?}")]
    UnknownField(ConflictId, String),

    /// Batch commit attempted while conflicts remain open.
    #[error("{0} conflict(s) still unresolved")]
    Unresolved(usize),
}

/// Failure reported by the remote collaborator for one send.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    /// Remote version differs from the basis of the local mutation.
    #[error("version conflict (remote version {version:?})")]
    Conflict {
        remote: Value,
        version: Option<u64>,
    },

    /// Network blip, timeout, 5xx. Worth retrying.
    #[error("transient error: {0}")]
    Transient(String),

    /// Validation rejection or schema mismatch. Never retried.
    #[error("fatal error: {0}")]
    Fatal(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }
}

/// Configuration could not be loaded or failed validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("config parse error: {0}")]
    Parse(#[from] ron::error::SpannedError),

    #[error("invalid config: {0}")]
    Invalid(String),
}
