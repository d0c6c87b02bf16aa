//! Pending mutations and the keys they coalesce on.
//!
//! A [`PendingChange`] is one not-yet-synced local mutation. The change log
//! holds at most one per [`EntityKey`]; later mutations fold into earlier
//! ones according to [`PendingChange::coalesce`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};

/// Kind of syncable entity a change targets.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
    EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum EntityType {
    Task,
    List,
    Tag,
}

/// Mutation verb.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Operation {
    Create,
    Update,
    Delete,
    Complete,
}

impl Operation {
    /// Drain priority class. Creates land before anything that may
    /// reference them; deletes go last.
    pub fn priority(self) -> u8 {
        match self {
            Operation::Create => 0,
            Operation::Update | Operation::Complete => 1,
            Operation::Delete => 2,
        }
    }

    /// Whether this operation carries an entity snapshot.
    pub fn has_payload(self) -> bool {
        !matches!(self, Operation::Delete)
    }
}

/// Identity of a change log slot: one entity of one type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_type: EntityType,
    pub id: String,
}

impl EntityKey {
    pub fn new(entity_type: EntityType, id: impl Into<String>) -> Self {
        Self { entity_type, id: id.into() }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.id)
    }
}

/// Error parsing an `EntityKey` from its `type:id` form.
#[derive(Debug, thiserror::Error)]
#[error("invalid entity key {0:?} (expected `type:id`)")]
pub struct ParseKeyError(pub String);

impl FromStr for EntityKey {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ty, id) = s.split_once(':').ok_or_else(|| ParseKeyError(s.to_string()))?;
        let entity_type = EntityType::from_str(ty).map_err(|_| ParseKeyError(s.to_string()))?;
        if id.is_empty() {
            return Err(ParseKeyError(s.to_string()));
        }
        Ok(Self::new(entity_type, id))
    }
}

/// A queued local mutation awaiting remote confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingChange {
    /// Entity id (not an id for the change itself).
    pub id: String,
    pub entity_type: EntityType,
    pub operation: Operation,
    /// Entity snapshot; `None` for deletes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Unix millis of the (latest) enqueue.
    pub enqueued_at: u64,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<u64>,
    /// Revision number assigned by the change log on enqueue.
    #[serde(default)]
    pub seq: u64,
    /// Remote version this mutation was made against, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_version: Option<u64>,
    /// Remote reported a conflict; skipped by drains until resolved.
    #[serde(default)]
    pub awaiting_resolution: bool,
}

impl PendingChange {
    /// Build a change stamped with the current time.
    pub fn new(
        entity_type: EntityType,
        id: impl Into<String>,
        operation: Operation,
        payload: Option<Value>,
    ) -> Self {
        Self::at(entity_type, id, operation, payload, crate::now_millis())
    }

    /// Build a change with an explicit enqueue timestamp.
    pub fn at(
        entity_type: EntityType,
        id: impl Into<String>,
        operation: Operation,
        payload: Option<Value>,
        enqueued_at: u64,
    ) -> Self {
        let payload = if operation.has_payload() { payload } else { None };
        Self {
            id: id.into(),
            entity_type,
            operation,
            payload,
            enqueued_at,
            attempts: 0,
            last_attempt_at: None,
            seq: 0,
            base_version: None,
            awaiting_resolution: false,
        }
    }

    pub fn with_base_version(mut self, version: u64) -> Self {
        self.base_version = Some(version);
        self
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.id.clone())
    }

    /// Sort key used by drains: priority class, then enqueue time, then seq.
    pub fn drain_order(&self) -> (u8, u64, u64) {
        (self.operation.priority(), self.enqueued_at, self.seq)
    }

    /// Fold `incoming` into `existing` (same key).
    ///
    /// Returns [`Coalesced::Cancelled`] when the pair cancels out: a create
    /// that was never attempted followed by its delete. A create that has
    /// been sent at least once may exist remotely, so its delete is kept.
    pub fn coalesce(existing: &PendingChange, incoming: PendingChange) -> Coalesced {
        use Operation::*;

        let base_version = existing.base_version.or(incoming.base_version);
        let mut next = match (existing.operation, incoming.operation) {
            (Create, Delete) if existing.attempts == 0 => return Coalesced::Cancelled,
            (Create, Update) | (Create, Complete) => {
                let mut merged = incoming;
                merged.operation = Create;
                merged.payload = merge_payload(existing.payload.as_ref(), merged.payload.take());
                return Coalesced::Merged(reset_revision(merged, base_version));
            }
            // Delete always wins; everything else is last-write-wins.
            _ => incoming,
        };
        if !next.operation.has_payload() {
            next.payload = None;
        }
        Coalesced::Replaced(reset_revision(next, base_version))
    }
}

fn reset_revision(mut change: PendingChange, base_version: Option<u64>) -> PendingChange {
    change.attempts = 0;
    change.last_attempt_at = None;
    change.awaiting_resolution = false;
    change.base_version = base_version;
    change
}

/// Result of folding a new mutation into an existing slot.
#[derive(Debug, Clone, PartialEq)]
pub enum Coalesced {
    Merged(PendingChange),
    Replaced(PendingChange),
    Cancelled,
}

/// Shallow-merge two JSON payloads; fields of `newer` win.
///
/// Non-object payloads are not merged: the newer one replaces the older.
pub fn merge_payload(older: Option<&Value>, newer: Option<Value>) -> Option<Value> {
    match (older, newer) {
        (Some(Value::Object(old)), Some(Value::Object(new))) => {
            let mut merged = old.clone();
            for (k, v) in new {
                merged.insert(k, v);
            }
            Some(Value::Object(merged))
        }
        (old, None) => old.cloned(),
        (_, new) => new,
    }
}

/// What [`ChangeLog::enqueue`](crate::ChangeLog::enqueue) did with a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnqueueOutcome {
    /// No prior entry for the key.
    Inserted,
    /// Folded into a pending create.
    Merged,
    /// Replaced the prior entry.
    Replaced,
    /// Cancelled a pending create; the slot is now empty.
    Cancelled,
}
