//! Durable, de-duplicating log of pending mutations.
//!
//! The log is a map keyed by [`EntityKey`] (one slot per entity), persisted
//! write-through to a [`KvStore`] after every mutation. Persistence failures
//! never lose the in-memory entry: they are logged, remembered, and the next
//! mutation (or [`ChangeLog::flush`]) retries the write.
//!
//! # Persisted format
//!
//! ```text
//! { "version": 1,
//!   "next_seq": 42,
//!   "entries": { "task:abc": { ...PendingChange... }, ... } }
//! ```
//!
//! Version 0 logs (a bare JSON array of changes) are migrated on load by
//! replaying them through the coalescing rule.

use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::change::{Coalesced, EnqueueOutcome, EntityKey, EntityType, Operation, PendingChange};
use crate::constants::CANCELLED_CREATE_MEMORY;
use crate::error::ImportError;
use crate::outcome::{DropReason, ItemOutcome, ItemResult};
use crate::store::KvStore;

/// Current on-disk format version.
pub const LOG_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct PersistedLog {
    version: u32,
    #[serde(default)]
    next_seq: u64,
    entries: IndexMap<String, PendingChange>,
}

/// Entries recovered from a serialized log.
struct Decoded {
    entries: IndexMap<EntityKey, PendingChange>,
    next_seq: u64,
}

pub struct ChangeLog {
    entries: IndexMap<EntityKey, PendingChange>,
    next_seq: u64,
    store: Arc<dyn KvStore>,
    storage_key: String,
    persistence_error: Option<String>,
    /// Creates removed by a delete before any outcome was seen, keyed to
    /// the last revision the delete cancelled.
    cancelled: IndexMap<EntityKey, u64>,
}

impl std::fmt::Debug for ChangeLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeLog")
            .field("entries", &self.entries.len())
            .field("next_seq", &self.next_seq)
            .field("storage_key", &self.storage_key)
            .field("persistence_error", &self.persistence_error)
            .finish()
    }
}

impl ChangeLog {
    /// Load the log stored under `storage_key`.
    ///
    /// Unreadable or corrupt state loads as an empty log with a warning.
    pub fn load(store: Arc<dyn KvStore>, storage_key: impl Into<String>) -> Self {
        let storage_key = storage_key.into();
        let mut log = Self {
            entries: IndexMap::new(),
            next_seq: 1,
            store,
            storage_key,
            persistence_error: None,
            cancelled: IndexMap::new(),
        };

        match log.store.load(&log.storage_key) {
            Ok(Some(raw)) => match decode(&raw) {
                Ok(decoded) => {
                    info!(
                        "Loaded {} pending change(s) from '{}'",
                        decoded.entries.len(),
                        log.storage_key
                    );
                    log.entries = decoded.entries;
                    log.next_seq = decoded.next_seq;
                }
                Err(e) => {
                    warn!("Discarding unreadable change log '{}': {}", log.storage_key, e);
                }
            },
            Ok(None) => debug!("No persisted change log under '{}'", log.storage_key),
            Err(e) => {
                warn!("Failed to read change log '{}': {}", log.storage_key, e);
                log.persistence_error = Some(e.to_string());
            }
        }
        log
    }

    /// Add a mutation, coalescing with any pending change for the same entity.
    pub fn enqueue(&mut self, change: PendingChange) -> EnqueueOutcome {
        let outcome = self.enqueue_in_memory(change);
        self.persist();
        outcome
    }

    fn enqueue_in_memory(&mut self, mut change: PendingChange) -> EnqueueOutcome {
        let key = change.key();
        let seq = self.bump_seq();

        let Some(existing) = self.entries.get(&key) else {
            change.seq = seq;
            self.entries.insert(key, change);
            return EnqueueOutcome::Inserted;
        };

        let existing_seq = existing.seq;
        let (mut next, outcome) = match PendingChange::coalesce(existing, change) {
            Coalesced::Cancelled => {
                debug!("Create+Delete for {} cancelled out", key);
                self.entries.shift_remove(&key);
                self.remember_cancelled(key, existing_seq);
                return EnqueueOutcome::Cancelled;
            }
            Coalesced::Merged(c) => (c, EnqueueOutcome::Merged),
            Coalesced::Replaced(c) => (c, EnqueueOutcome::Replaced),
        };
        next.seq = seq;
        // Move to the back so map order follows enqueue order.
        self.entries.shift_remove(&key);
        self.entries.insert(key, next);
        outcome
    }

    /// Remove the change for an entity (confirmed remote success).
    pub fn dequeue(&mut self, entity_type: EntityType, id: &str) -> Option<PendingChange> {
        let removed = self.entries.shift_remove(&EntityKey::new(entity_type, id));
        if removed.is_some() {
            self.persist();
        }
        removed
    }

    /// Pending changes in enqueue order (stable by `enqueued_at`, then `seq`).
    pub fn all(&self) -> Vec<PendingChange> {
        let mut all: Vec<PendingChange> = self.entries.values().cloned().collect();
        all.sort_by_key(|c| (c.enqueued_at, c.seq));
        all
    }

    pub fn get(&self, key: &EntityKey) -> Option<&PendingChange> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Discard every pending change.
    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            info!("Discarding {} pending change(s)", self.entries.len());
        }
        self.entries.clear();
        self.cancelled.clear();
        self.persist();
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries blocked on a conflict resolution.
    pub fn awaiting_resolution(&self) -> usize {
        self.entries.values().filter(|c| c.awaiting_resolution).count()
    }

    /// Record the result of a send.
    ///
    /// Returns `false` (and changes nothing) when the outcome is stale: the
    /// entry is gone or was superseded by a newer mutation while the send
    /// was in flight.
    pub fn apply_outcome(&mut self, outcome: &ItemOutcome) -> bool {
        let key = outcome.key();
        let Some(entry) = self.entries.get_mut(&key) else {
            debug!("Ignoring outcome for {}: no longer queued", key);
            return false;
        };
        if entry.seq != outcome.change.seq {
            debug!(
                "Ignoring stale outcome for {} (sent seq {}, queued seq {})",
                key, outcome.change.seq, entry.seq
            );
            return false;
        }

        match &outcome.result {
            ItemResult::Synced { .. } | ItemResult::Dropped { .. } => {
                self.entries.shift_remove(&key);
            }
            ItemResult::Retrying { .. } => {
                entry.attempts = outcome.change.attempts;
                entry.last_attempt_at = outcome.change.last_attempt_at;
            }
            ItemResult::Conflict { version, .. } => {
                entry.attempts = outcome.change.attempts;
                entry.last_attempt_at = outcome.change.last_attempt_at;
                entry.awaiting_resolution = true;
                // Later local edits are made against what the remote holds now.
                entry.base_version = *version;
            }
        }
        self.persist();
        true
    }

    /// Follow up on an outcome [`apply_outcome`](Self::apply_outcome)
    /// rejected.
    ///
    /// A create cancelled by its delete may already have been in flight. If
    /// the remote may have applied it, the delete is queued after all.
    /// Returns the queued delete.
    pub fn reconcile_cancelled(&mut self, outcome: &ItemOutcome) -> Option<PendingChange> {
        let key = outcome.key();
        match self.cancelled.get(&key) {
            Some(&seq) if outcome.change.seq <= seq => {
                self.cancelled.shift_remove(&key);
            }
            _ => return None,
        }
        // Re-created since: the queued change upserts over the remote copy.
        if self.entries.contains_key(&key) {
            return None;
        }
        if matches!(outcome.result, ItemResult::Dropped { reason: DropReason::Fatal, .. }) {
            return None;
        }
        info!("Cancelled create for {} reached the remote, queueing its delete", key);
        let delete = PendingChange::new(key.entity_type, key.id.clone(), Operation::Delete, None);
        self.enqueue(delete);
        self.entries.get(&key).cloned()
    }

    fn remember_cancelled(&mut self, key: EntityKey, seq: u64) {
        self.cancelled.shift_remove(&key);
        self.cancelled.insert(key, seq);
        while self.cancelled.len() > CANCELLED_CREATE_MEMORY {
            self.cancelled.shift_remove_index(0);
        }
    }

    /// Replace a conflicted entry's payload with a resolved one, rebased on
    /// the remote version, and make it eligible for the next drain.
    ///
    /// Creates and completes become updates: the entity exists remotely by
    /// the time a conflict is reported. Deletes stay deletes.
    pub fn rebase(
        &mut self,
        key: &EntityKey,
        payload: Option<Value>,
        base_version: Option<u64>,
    ) -> bool {
        let seq = self.next_seq;
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        if entry.operation.has_payload() {
            entry.operation = Operation::Update;
            entry.payload = payload;
        }
        entry.base_version = base_version;
        entry.awaiting_resolution = false;
        entry.attempts = 0;
        entry.last_attempt_at = None;
        entry.seq = seq;
        self.next_seq += 1;
        self.persist();
        true
    }

    /// Serialize the log in its persisted format.
    pub fn export_json(&self) -> String {
        serde_json::to_string_pretty(&self.to_persisted())
            .unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"))
    }

    /// Replace the log with an exported one. Returns the entry count.
    pub fn import_json(&mut self, raw: &str) -> Result<usize, ImportError> {
        let decoded = decode(raw)?;
        let mut next_seq = self.next_seq.max(decoded.next_seq);
        self.entries.clear();
        self.cancelled.clear();
        for (key, mut change) in decoded.entries {
            change.seq = next_seq;
            next_seq += 1;
            self.entries.insert(key, change);
        }
        self.next_seq = next_seq;
        info!("Imported {} pending change(s)", self.entries.len());
        self.persist();
        Ok(self.entries.len())
    }

    /// Retry persisting the current state. Returns whether it succeeded.
    pub fn flush(&mut self) -> bool {
        self.persist();
        self.persistence_error.is_none()
    }

    /// Last persistence failure, cleared by the next successful write.
    pub fn persistence_error(&self) -> Option<&str> {
        self.persistence_error.as_deref()
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn to_persisted(&self) -> PersistedLog {
        PersistedLog {
            version: LOG_FORMAT_VERSION,
            next_seq: self.next_seq,
            entries: self
                .entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }

    fn persist(&mut self) {
        let result = serde_json::to_string(&self.to_persisted())
            .map_err(crate::error::PersistenceError::from)
            .and_then(|raw| self.store.save(&self.storage_key, &raw));
        match result {
            Ok(()) => {
                if self.persistence_error.take().is_some() {
                    info!("Change log persistence recovered");
                }
            }
            Err(e) => {
                warn!(
                    "Failed to persist change log ({} entries kept in memory): {}",
                    self.entries.len(),
                    e
                );
                self.persistence_error = Some(e.to_string());
            }
        }
    }
}

fn decode(raw: &str) -> Result<Decoded, ImportError> {
    let value: Value = serde_json::from_str(raw)?;

    if value.is_array() {
        let legacy: Vec<PendingChange> = serde_json::from_value(value)?;
        return Ok(migrate_v0(legacy));
    }

    let version = value.get("version").and_then(Value::as_u64).unwrap_or(0);
    if version != u64::from(LOG_FORMAT_VERSION) {
        return Err(ImportError::UnsupportedVersion(version));
    }

    let persisted: PersistedLog = serde_json::from_value(value)?;
    let mut entries = IndexMap::with_capacity(persisted.entries.len());
    let mut max_seq = 0;
    for change in persisted.entries.into_values() {
        max_seq = max_seq.max(change.seq);
        entries.insert(change.key(), change);
    }
    Ok(Decoded { entries, next_seq: persisted.next_seq.max(max_seq + 1) })
}

/// Rebuild a v0 array by replaying it through the coalescing rule, which
/// also repairs duplicate entries the old format allowed.
fn migrate_v0(mut legacy: Vec<PendingChange>) -> Decoded {
    legacy.sort_by_key(|c| c.enqueued_at);
    let mut entries: IndexMap<EntityKey, PendingChange> = IndexMap::new();
    let mut next_seq = 1;
    for mut change in legacy {
        let key = change.key();
        change.seq = next_seq;
        next_seq += 1;
        match entries.get(&key) {
            None => {
                entries.insert(key, change);
            }
            Some(existing) => match PendingChange::coalesce(existing, change) {
                Coalesced::Cancelled => {
                    entries.shift_remove(&key);
                }
                Coalesced::Merged(c) | Coalesced::Replaced(c) => {
                    entries.shift_remove(&key);
                    entries.insert(key, c);
                }
            },
        }
    }
    info!("Migrated {} legacy pending change(s)", entries.len());
    Decoded { entries, next_seq }
}
