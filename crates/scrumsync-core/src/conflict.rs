//! Field-level conflict detection and resolution.
//!
//! When the remote reports that an entity moved on since the local mutation
//! was made, the drain hands both snapshots here. The resolver lists the
//! differing fields and lets the caller keep the local version, keep the
//! remote version, or merge field by field.
//!
//! Resolutions are collected as a batch: [`ConflictResolver::commit`] only
//! releases the batch once every conflict in it has been resolved.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::Display;
use tracing::{debug, info};

use crate::change::{EntityKey, EntityType, PendingChange};
use crate::error::ConflictError;

/// Conflict identifier (UUIDv7).
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConflictId(uuid::Uuid);

impl ConflictId {
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7())
    }

    /// First 8 hex characters, for display.
    pub fn short(&self) -> String {
        self.0.as_simple().to_string()[..8].to_string()
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        uuid::Uuid::parse_str(s).map(Self)
    }
}

impl Default for ConflictId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConflictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ConflictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConflictId({})", self.short())
    }
}

/// Which snapshot to take a value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Side {
    Local,
    Remote,
}

/// How to settle one conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ResolutionChoice {
    Local,
    Remote,
    /// Remote snapshot overlaid with local values, honouring field picks.
    Merge,
}

impl From<Side> for ResolutionChoice {
    fn from(side: Side) -> Self {
        match side {
            Side::Local => ResolutionChoice::Local,
            Side::Remote => ResolutionChoice::Remote,
        }
    }
}

/// One differing field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDiff {
    pub field: String,
    pub local_value: Value,
    pub remote_value: Value,
}

/// Bookkeeping and server-derived fields that never count as a conflict.
fn ignored_fields(entity_type: EntityType) -> &'static [&'static str] {
    match entity_type {
        EntityType::Task => &["updated_at", "created_at", "version"],
        EntityType::List => &["updated_at", "created_at", "version", "task_count"],
        EntityType::Tag => &["updated_at", "created_at", "version", "usage_count"],
    }
}

/// List the fields where `local` and `remote` disagree.
///
/// Only fields present in the local snapshot are compared: a field the local
/// mutation never touched cannot conflict. Non-object snapshots compare as a
/// single `""` field. Output is sorted by field name.
pub fn detect(local: &Value, remote: &Value, entity_type: EntityType) -> Vec<FieldDiff> {
    let (Value::Object(local_map), Value::Object(remote_map)) = (local, remote) else {
        if local == remote {
            return Vec::new();
        }
        return vec![FieldDiff {
            field: String::new(),
            local_value: local.clone(),
            remote_value: remote.clone(),
        }];
    };

    let ignored = ignored_fields(entity_type);
    let fields: BTreeSet<&String> = local_map.keys().collect();
    fields
        .into_iter()
        .filter(|f| !ignored.contains(&f.as_str()))
        .filter_map(|field| {
            let local_value = &local_map[field];
            let remote_value = remote_map.get(field).unwrap_or(&Value::Null);
            (local_value != remote_value).then(|| FieldDiff {
                field: field.clone(),
                local_value: local_value.clone(),
                remote_value: remote_value.clone(),
            })
        })
        .collect()
}

/// A divergence between a queued change and the remote entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: ConflictId,
    pub key: EntityKey,
    /// Local snapshot (the pending change's payload, `null` for deletes).
    pub local: Value,
    pub remote: Value,
    pub remote_version: Option<u64>,
    pub diffs: Vec<FieldDiff>,
    /// Per-field picks used by a merge; unpicked fields take the local value.
    #[serde(default)]
    pub selections: HashMap<String, Side>,
    #[serde(default)]
    pub resolution: Option<Resolution>,
}

impl Conflict {
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }

    fn resolve_with(&self, choice: ResolutionChoice) -> Value {
        match choice {
            ResolutionChoice::Local => self.local.clone(),
            ResolutionChoice::Remote => self.remote.clone(),
            ResolutionChoice::Merge => self.merged(),
        }
    }

    fn merged(&self) -> Value {
        let Value::Object(remote) = &self.remote else {
            return self.local.clone();
        };
        let mut merged: Map<String, Value> = remote.clone();
        for diff in &self.diffs {
            let side = self.selections.get(&diff.field).copied().unwrap_or(Side::Local);
            let value = match side {
                Side::Local => diff.local_value.clone(),
                Side::Remote => diff.remote_value.clone(),
            };
            merged.insert(diff.field.clone(), value);
        }
        Value::Object(merged)
    }
}

/// The settled form of a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub choice: ResolutionChoice,
    pub entity: Value,
}

/// A resolved conflict released by [`ConflictResolver::commit`].
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConflict {
    pub id: ConflictId,
    pub key: EntityKey,
    pub choice: ResolutionChoice,
    pub entity: Value,
    pub remote_version: Option<u64>,
}

/// Tracks open conflicts for one batch.
#[derive(Debug, Default)]
pub struct ConflictResolver {
    conflicts: IndexMap<ConflictId, Conflict>,
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a conflict for `change`. Replaces any earlier conflict for the
    /// same entity.
    pub fn register(
        &mut self,
        change: &PendingChange,
        remote: Value,
        remote_version: Option<u64>,
    ) -> ConflictId {
        let key = change.key();
        self.conflicts.retain(|_, c| c.key != key);

        let local = change.payload.clone().unwrap_or(Value::Null);
        let diffs = detect(&local, &remote, change.entity_type);
        let id = ConflictId::new();
        info!(
            "Conflict {} on {}: {} differing field(s), remote version {:?}",
            id.short(),
            key,
            diffs.len(),
            remote_version
        );
        self.conflicts.insert(
            id,
            Conflict {
                id,
                key,
                local,
                remote,
                remote_version,
                diffs,
                selections: HashMap::new(),
                resolution: None,
            },
        );
        id
    }

    pub fn get(&self, id: ConflictId) -> Option<&Conflict> {
        self.conflicts.get(&id)
    }

    /// Conflicts in registration order.
    pub fn conflicts(&self) -> impl Iterator<Item = &Conflict> {
        self.conflicts.values()
    }

    pub fn unresolved(&self) -> impl Iterator<Item = &Conflict> {
        self.conflicts.values().filter(|c| !c.is_resolved())
    }

    pub fn unresolved_count(&self) -> usize {
        self.unresolved().count()
    }

    pub fn len(&self) -> usize {
        self.conflicts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conflicts.is_empty()
    }

    /// Pin one differing field to a side for a later merge.
    pub fn select_field(
        &mut self,
        id: ConflictId,
        field: &str,
        side: Side,
    ) -> Result<(), ConflictError> {
        let conflict = self.conflicts.get_mut(&id).ok_or(ConflictError::NotFound(id))?;
        if !conflict.diffs.iter().any(|d| d.field == field) {
            return Err(ConflictError::UnknownField(id, field.to_string()));
        }
        conflict.selections.insert(field.to_string(), side);
        Ok(())
    }

    /// Settle one conflict, returning the resolved entity.
    pub fn resolve(
        &mut self,
        id: ConflictId,
        choice: ResolutionChoice,
    ) -> Result<Value, ConflictError> {
        let conflict = self.conflicts.get_mut(&id).ok_or(ConflictError::NotFound(id))?;
        let entity = conflict.resolve_with(choice);
        debug!("Conflict {} on {} resolved as {}", id.short(), conflict.key, choice);
        conflict.resolution = Some(Resolution { choice, entity: entity.clone() });
        Ok(entity)
    }

    /// Apply one side to every still-unresolved conflict.
    pub fn resolve_all(&mut self, side: Side) -> Vec<(ConflictId, Value)> {
        let choice = ResolutionChoice::from(side);
        self.conflicts
            .values_mut()
            .filter(|c| !c.is_resolved())
            .map(|c| {
                let entity = c.resolve_with(choice);
                c.resolution = Some(Resolution { choice, entity: entity.clone() });
                (c.id, entity)
            })
            .collect()
    }

    pub fn all_resolved(&self) -> bool {
        self.conflicts.values().all(Conflict::is_resolved)
    }

    /// Release the batch. Fails, leaving everything in place, while any
    /// conflict is still open.
    pub fn commit(&mut self) -> Result<Vec<ResolvedConflict>, ConflictError> {
        let open = self.unresolved_count();
        if open > 0 {
            return Err(ConflictError::Unresolved(open));
        }
        Ok(self
            .conflicts
            .drain(..)
            .filter_map(|(id, c)| {
                c.resolution.map(|r| ResolvedConflict {
                    id,
                    key: c.key,
                    choice: r.choice,
                    entity: r.entity,
                    remote_version: c.remote_version,
                })
            })
            .collect())
    }

    /// Forget conflicts for entities that are no longer queued.
    pub fn retain_keys(&mut self, mut keep: impl FnMut(&EntityKey) -> bool) {
        self.conflicts.retain(|_, c| keep(&c.key));
    }

    pub fn clear(&mut self) {
        self.conflicts.clear();
    }
}
