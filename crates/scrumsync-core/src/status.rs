//! Derived sync status for UI indicators.

use serde::{Deserialize, Serialize};

/// Snapshot recomputed on demand from the log, engine, and monitor.
/// Never persisted and never the source of truth.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub queue_length: usize,
    pub is_processing: bool,
    pub is_online: bool,
    /// Unix millis of the last pass that synced something.
    pub last_sync_at: Option<u64>,
    pub last_error: Option<String>,
    pub pending_conflicts: usize,
    /// Changes dropped after a permanent failure, awaiting retry or discard.
    pub failed_changes: usize,
}

impl SyncStatus {
    /// Nothing queued, nothing failed, nothing waiting on the user.
    pub fn is_settled(&self) -> bool {
        self.queue_length == 0
            && !self.is_processing
            && self.pending_conflicts == 0
            && self.failed_changes == 0
    }
}
