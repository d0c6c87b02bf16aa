//! Syncable entity models.
//!
//! Every entity kind the change log carries implements [`Syncable`]: it can
//! be turned into a change payload and can absorb a remote snapshot. New
//! entity kinds add an [`EntityType`] variant and a `Syncable` impl.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::change::{EntityType, Operation, PendingChange, merge_payload};

pub trait Syncable: Serialize + DeserializeOwned {
    const ENTITY_TYPE: EntityType;

    fn entity_id(&self) -> &str;

    /// Snapshot sent as a change payload.
    fn to_payload(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Overwrite local fields with those present in a remote snapshot.
    fn apply_remote(&mut self, remote: &Value) -> Result<(), serde_json::Error> {
        let current = self.to_payload()?;
        let merged = merge_payload(Some(&current), Some(remote.clone())).unwrap_or(current);
        *self = serde_json::from_value(merged)?;
        Ok(())
    }

    /// Build a pending change for this entity.
    fn to_change(&self, operation: Operation) -> Result<PendingChange, serde_json::Error> {
        let payload = if operation.has_payload() { Some(self.to_payload()?) } else { None };
        Ok(PendingChange::new(Self::ENTITY_TYPE, self.entity_id(), operation, payload))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Todo,
    InProgress,
    Review,
    Done,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub list_id: Option<String>,
    #[serde(default)]
    pub tag_ids: Vec<String>,
    #[serde(default)]
    pub story_points: Option<u32>,
    #[serde(default)]
    pub updated_at: u64,
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: None,
            status: TaskStatus::Todo,
            completed: false,
            list_id: None,
            tag_ids: Vec::new(),
            story_points: None,
            updated_at: crate::now_millis(),
        }
    }

    /// Payload for a `Complete` change.
    pub fn completion_payload(&self) -> Value {
        serde_json::json!({ "completed": self.completed, "status": self.status })
    }
}

impl Syncable for Task {
    const ENTITY_TYPE: EntityType = EntityType::Task;

    fn entity_id(&self) -> &str {
        &self.id
    }

    fn to_change(&self, operation: Operation) -> Result<PendingChange, serde_json::Error> {
        let payload = match operation {
            Operation::Delete => None,
            Operation::Complete => Some(self.completion_payload()),
            Operation::Create | Operation::Update => Some(self.to_payload()?),
        };
        Ok(PendingChange::new(Self::ENTITY_TYPE, &self.id, operation, payload))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskList {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub position: u32,
    /// Server-maintained counter.
    #[serde(default)]
    pub task_count: u32,
    #[serde(default)]
    pub updated_at: u64,
}

impl Syncable for TaskList {
    const ENTITY_TYPE: EntityType = EntityType::List;

    fn entity_id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
    /// Server-maintained counter.
    #[serde(default)]
    pub usage_count: u32,
    #[serde(default)]
    pub updated_at: u64,
}

impl Syncable for Tag {
    const ENTITY_TYPE: EntityType = EntityType::Tag;

    fn entity_id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_changes() {
        let mut task = Task::new("t1", "Write tests");
        task.completed = true;
        task.status = TaskStatus::Done;

        let create = task.to_change(Operation::Create).unwrap();
        assert_eq!(create.entity_type, EntityType::Task);
        assert_eq!(create.payload.as_ref().unwrap()["title"], "Write tests");

        let complete = task.to_change(Operation::Complete).unwrap();
        assert_eq!(complete.payload, Some(json!({"completed": true, "status": "done"})));

        let delete = task.to_change(Operation::Delete).unwrap();
        assert!(delete.payload.is_none());
    }

    #[test]
    fn test_apply_remote_overrides_present_fields() {
        let mut list = TaskList {
            id: "l1".into(),
            name: "Backlog".into(),
            position: 0,
            task_count: 0,
            updated_at: 1,
        };
        list.apply_remote(&json!({"name": "Sprint 4", "task_count": 12})).unwrap();
        assert_eq!(list.name, "Sprint 4");
        assert_eq!(list.task_count, 12);
        assert_eq!(list.id, "l1");

        let mut tag = Tag { id: "g".into(), name: "bug".into(), color: None, usage_count: 0, updated_at: 0 };
        assert!(tag.apply_remote(&json!({"name": 5})).is_err());
    }
}
