//! Network side of scrumsync: draining the change log against the remote.
//!
//! - [`RemoteStore`]: the remote collaborator seam, with [`InMemoryRemote`]
//!   as a versioned in-process implementation
//! - [`ConnectivityMonitor`]: online/offline state shared by everything
//! - [`SyncEngine`]: one drain pass over any [`DrainQueue`]
//! - [`spawn_worker`]: the background worker and its message protocol
//! - [`SyncService`]: the facade UIs talk to

pub mod connectivity;
pub mod constants;
pub mod engine;
pub mod error;
pub mod remote;
pub mod service;
pub mod worker;

pub use connectivity::{ConnectivityMonitor, ConnectivityState, Subscription};
pub use engine::{DrainPlan, DrainQueue, DrainReport, SyncEngine};
pub use error::ServiceError;
pub use remote::{InMemoryRemote, RemoteCall, RemoteStore};
pub use service::{DrainMode, FailedChange, SyncService};
pub use worker::{
    QueueMirror, WorkerCommand, WorkerError, WorkerEvent, WorkerHandle, WorkerStatus, spawn_worker,
};
