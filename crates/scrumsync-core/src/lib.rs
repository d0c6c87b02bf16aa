//! Offline change queue for scrumsync clients.
//!
//! Holds everything about pending local mutations that does not need a
//! network: the durable [`ChangeLog`] with its coalescing rule, the
//! [`KvStore`] persistence seam, field-level [`conflict`] handling, the
//! bounded [`SyncHistory`], and [`SyncConfig`].
//!
//! # Coalescing
//!
//! | pending  | incoming          | result                            |
//! |----------|-------------------|-----------------------------------|
//! | Create   | Update / Complete | Create with merged payload        |
//! | Create   | Delete            | slot removed (never attempted)    |
//! | any      | Delete            | Delete                            |
//! | any      | other             | incoming replaces pending         |

pub mod change;
pub mod change_log;
pub mod config;
pub mod conflict;
pub mod constants;
pub mod entity;
pub mod error;
pub mod history;
pub mod outcome;
pub mod status;
pub mod store;

pub use change::{EnqueueOutcome, EntityKey, EntityType, Operation, PendingChange};
pub use change_log::ChangeLog;
pub use config::SyncConfig;
pub use conflict::{
    Conflict, ConflictId, ConflictResolver, FieldDiff, ResolutionChoice, ResolvedConflict, Side,
};
pub use entity::{Syncable, Tag, Task, TaskList, TaskStatus};
pub use error::{ConfigError, ConflictError, ImportError, PersistenceError, RemoteError};
pub use history::{SyncEvent, SyncEventKind, SyncHistory};
pub use outcome::{DropReason, ItemOutcome, ItemResult};
pub use status::SyncStatus;
pub use store::{KvStore, MemoryStore, SqliteStore};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
