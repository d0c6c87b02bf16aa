//! Errors surfaced by the service facade.
//!
//! Sync failures themselves never show up here: they are recorded as
//! history events and status fields. These cover misuse and lifecycle.

use thiserror::Error;

use scrumsync_core::{ConfigError, ConflictError};

use crate::worker::WorkerError;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error("cannot sync while offline")]
    Offline,

    /// The worker turned a sync request down.
    #[error("sync refused: {0}")]
    SyncRefused(String),

    #[error("sync worker unavailable: {0}")]
    Worker(#[from] WorkerError),

    #[error("a sync pass is already running")]
    Busy,

    #[error("service disposed")]
    Disposed,
}
