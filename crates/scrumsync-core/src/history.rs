//! Bounded record of sync events.
//!
//! A pure recorder: callers push [`SyncEvent`]s, the oldest are evicted once
//! the capacity is reached, and live subscribers receive each event through a
//! broadcast channel. Dropping a receiver unsubscribes it.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use strum::Display;
use tokio::sync::broadcast;

use crate::change::EntityKey;
use crate::constants::{HISTORY_BROADCAST_CAPACITY, MAX_HISTORY_CAPACITY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SyncEventKind {
    Started,
    Success,
    Error,
    ConnectivityLost,
    ConnectivityRestored,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    pub kind: SyncEventKind,
    /// Unix millis.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Entity an error concerns, for per-change failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<EntityKey>,
}

impl SyncEvent {
    pub fn new(kind: SyncEventKind) -> Self {
        Self {
            kind,
            timestamp: crate::now_millis(),
            change_count: None,
            details: None,
            entity: None,
        }
    }

    pub fn with_count(mut self, count: usize) -> Self {
        self.change_count = Some(count);
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_entity(mut self, key: EntityKey) -> Self {
        self.entity = Some(key);
        self
    }
}

#[derive(Debug)]
pub struct SyncHistory {
    events: VecDeque<SyncEvent>,
    capacity: usize,
    tx: broadcast::Sender<SyncEvent>,
}

impl SyncHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, MAX_HISTORY_CAPACITY);
        let (tx, _) = broadcast::channel(HISTORY_BROADCAST_CAPACITY);
        Self { events: VecDeque::new(), capacity, tx }
    }

    /// Append an event, evicting the oldest when full.
    pub fn record(&mut self, event: SyncEvent) {
        while self.events.len() >= self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event.clone());
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    /// Oldest first.
    pub fn events(&self) -> impl Iterator<Item = &SyncEvent> {
        self.events.iter()
    }

    pub fn latest(&self) -> Option<&SyncEvent> {
        self.events.back()
    }

    pub fn count(&self, kind: SyncEventKind) -> usize {
        self.events.iter().filter(|e| e.kind == kind).count()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Change the retention, evicting oldest events if it shrank.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.clamp(1, MAX_HISTORY_CAPACITY);
        while self.events.len() > self.capacity {
            self.events.pop_front();
        }
    }

    pub fn export_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.events)
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}
