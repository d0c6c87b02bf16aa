//! Per-item results of a drain pass.

use serde_json::Value;

use crate::change::{EntityKey, PendingChange};

/// Why a change left the log without reaching the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum DropReason {
    /// Transient failures hit `max_retries`.
    RetriesExhausted,
    /// Remote rejected the change outright.
    Fatal,
}

/// What happened to one change during a send.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemResult {
    /// Remote accepted; `applied` is the entity as stored remotely.
    Synced { applied: Value },
    /// Transient failure with retry budget left.
    Retrying { error: String },
    /// Removed from the queue and reported as a permanent failure.
    Dropped { reason: DropReason, error: String },
    /// Remote version diverged from the change's basis.
    Conflict { remote: Value, version: Option<u64> },
}

/// A change as it stood after the attempt, paired with its result.
///
/// `change.seq` identifies the log revision that was sent; queues ignore
/// outcomes whose revision has since been superseded.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemOutcome {
    pub change: PendingChange,
    pub result: ItemResult,
}

impl ItemOutcome {
    pub fn key(&self) -> EntityKey {
        self.change.key()
    }

    pub fn is_synced(&self) -> bool {
        matches!(self.result, ItemResult::Synced { .. })
    }

    pub fn is_dropped(&self) -> bool {
        matches!(self.result, ItemResult::Dropped { .. })
    }

    /// True when the outcome removes the change from its queue.
    pub fn removes_change(&self) -> bool {
        self.is_synced() || self.is_dropped()
    }
}
