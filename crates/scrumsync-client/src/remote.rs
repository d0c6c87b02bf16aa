//! The remote collaborator: the authoritative store changes are replayed to.
//!
//! [`RemoteStore`] is the only seam the engine talks through. Implementations
//! must treat Create and Delete idempotently, because a retry can resend a
//! mutation whose first response was lost.
//!
//! [`InMemoryRemote`] implements the contract in-process with versioned
//! records, which makes it usable as a test double and for local simulation.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, trace};

use scrumsync_core::change::merge_payload;
use scrumsync_core::{EntityKey, EntityType, Operation, PendingChange, RemoteError};

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Apply one change. Returns the entity as stored remotely (`null` for
    /// deletes).
    async fn send(&self, change: &PendingChange) -> Result<Value, RemoteError>;

    /// Minimal round-trip to the health endpoint.
    async fn ping(&self) -> Result<(), RemoteError>;
}

// ============================================================================
// InMemoryRemote
// ============================================================================

#[derive(Debug, Clone)]
struct Record {
    entity: Value,
    version: u64,
    deleted: bool,
}

/// One `send` as seen by the remote.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCall {
    pub key: EntityKey,
    pub operation: Operation,
    pub attempt: u32,
}

#[derive(Debug, Default)]
struct RemoteState {
    records: HashMap<EntityKey, Record>,
    /// Failures returned by the next sends, whatever their key.
    faults: VecDeque<RemoteError>,
    /// Failures returned by the next sends for one key.
    key_faults: HashMap<EntityKey, VecDeque<RemoteError>>,
    calls: Vec<RemoteCall>,
    unreachable: bool,
}

/// Versioned in-process remote store.
#[derive(Debug, Default)]
pub struct InMemoryRemote {
    state: Mutex<RemoteState>,
    latency: Mutex<Option<Duration>>,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call, to keep sends in flight.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Fail every call with a transient error while `true`.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    /// Queue a failure for the next send.
    pub fn fail_next(&self, error: RemoteError) {
        self.state.lock().faults.push_back(error);
    }

    /// Queue `times` copies of a failure for sends of one entity.
    pub fn fail_key(&self, key: EntityKey, error: RemoteError, times: usize) {
        let mut state = self.state.lock();
        let queue = state.key_faults.entry(key).or_default();
        queue.extend(std::iter::repeat_n(error, times));
    }

    /// Install an entity as if another client had created it.
    pub fn seed(&self, key: EntityKey, entity: Value, version: u64) {
        self.state
            .lock()
            .records
            .insert(key, Record { entity, version, deleted: false });
    }

    /// Edit an entity as another client would, bumping its version.
    pub fn edit(&self, key: &EntityKey, patch: Value) -> Option<u64> {
        let mut state = self.state.lock();
        let record = state.records.get_mut(key).filter(|r| !r.deleted)?;
        record.entity = merge_payload(Some(&record.entity), Some(patch)).unwrap_or(Value::Null);
        record.version += 1;
        Some(record.version)
    }

    /// Live entity and its version.
    pub fn get(&self, key: &EntityKey) -> Option<(Value, u64)> {
        let state = self.state.lock();
        state
            .records
            .get(key)
            .filter(|r| !r.deleted)
            .map(|r| (r.entity.clone(), r.version))
    }

    /// Number of live entities of one type.
    pub fn count(&self, entity_type: EntityType) -> usize {
        self.state
            .lock()
            .records
            .iter()
            .filter(|(k, r)| k.entity_type == entity_type && !r.deleted)
            .count()
    }

    /// Every send received so far, in arrival order.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state.lock().calls.clone()
    }

    fn take_fault(state: &mut RemoteState, key: &EntityKey) -> Option<RemoteError> {
        if let Some(queue) = state.key_faults.get_mut(key) {
            if let Some(err) = queue.pop_front() {
                return Some(err);
            }
        }
        state.faults.pop_front()
    }

    fn apply(state: &mut RemoteState, change: &PendingChange) -> Result<Value, RemoteError> {
        let key = change.key();

        // Version check applies to mutations of a live record only.
        if let Some(record) = state.records.get(&key).filter(|r| !r.deleted) {
            if let Some(base) = change.base_version {
                if base != record.version && change.operation != Operation::Create {
                    return Err(RemoteError::Conflict {
                        remote: record.entity.clone(),
                        version: Some(record.version),
                    });
                }
            }
        }

        match change.operation {
            Operation::Create => {
                let payload = with_id(change.payload.clone(), &change.id);
                match state.records.get_mut(&key) {
                    Some(record) if !record.deleted => {
                        // Replayed create: upsert, no duplicate.
                        let merged = merge_payload(Some(&record.entity), Some(payload))
                            .unwrap_or(Value::Null);
                        if merged != record.entity {
                            record.entity = merged;
                            record.version += 1;
                        }
                        trace!("Create for existing {} treated as upsert", key);
                        Ok(record.entity.clone())
                    }
                    Some(record) => {
                        record.entity = payload;
                        record.version += 1;
                        record.deleted = false;
                        Ok(record.entity.clone())
                    }
                    None => {
                        state.records.insert(
                            key,
                            Record { entity: payload.clone(), version: 1, deleted: false },
                        );
                        Ok(payload)
                    }
                }
            }
            Operation::Update | Operation::Complete => {
                let Some(record) = state.records.get_mut(&key).filter(|r| !r.deleted) else {
                    return Err(RemoteError::Fatal(format!("{key} does not exist")));
                };
                record.entity = merge_payload(Some(&record.entity), change.payload.clone())
                    .unwrap_or(Value::Null);
                record.version += 1;
                Ok(record.entity.clone())
            }
            Operation::Delete => {
                if let Some(record) = state.records.get_mut(&key) {
                    if !record.deleted {
                        record.deleted = true;
                        record.version += 1;
                    }
                }
                Ok(Value::Null)
            }
        }
    }
}

fn with_id(payload: Option<Value>, id: &str) -> Value {
    match payload {
        Some(Value::Object(mut map)) => {
            map.entry("id").or_insert_with(|| Value::String(id.to_string()));
            Value::Object(map)
        }
        Some(other) => other,
        None => serde_json::json!({ "id": id }),
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemote {
    async fn send(&self, change: &PendingChange) -> Result<Value, RemoteError> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock();
        let key = change.key();
        state.calls.push(RemoteCall {
            key: key.clone(),
            operation: change.operation,
            attempt: change.attempts,
        });

        if state.unreachable {
            return Err(RemoteError::Transient("remote unreachable".into()));
        }
        if let Some(err) = Self::take_fault(&mut state, &key) {
            debug!("Injected failure for {}: {}", key, err);
            return Err(err);
        }
        Self::apply(&mut state, change)
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        if self.state.lock().unreachable {
            return Err(RemoteError::Transient("remote unreachable".into()));
        }
        Ok(())
    }
}
