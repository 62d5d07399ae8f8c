//! Wire event frames.
//!
//! Every frame on a streaming channel is `{type, data, timestamp, scope}`.
//! Events are a forwarding mechanism, not a log — nothing here is persisted
//! beyond delivery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{ConversationMessage, Task, TaskStatus};
use crate::errors::SyncError;

/// Named categories a subscriber declares interest in.
pub mod scopes {
    /// Task lifecycle events (created/updated/status_changed/deleted).
    pub const TASKS: &str = "tasks";
    /// Conversation events (response_created).
    pub const CONVERSATIONS: &str = "conversations";
    /// Channel-level frames (heartbeat).
    pub const SYSTEM: &str = "system";
}

/// Event type identifiers.
pub mod types {
    pub const TASK_CREATED: &str = "task.created";
    pub const TASK_UPDATED: &str = "task.updated";
    pub const TASK_STATUS_CHANGED: &str = "task.status_changed";
    pub const TASK_DELETED: &str = "task.deleted";
    pub const RESPONSE_CREATED: &str = "task.response_created";
    pub const HEARTBEAT: &str = "heartbeat";
    /// Wildcard handler registration — receives every dispatched event.
    pub const WILDCARD: &str = "*";
}

/// One event frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    pub scope: String,
}

/// Payload of a `task.status_changed` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChangedPayload {
    pub id: String,
    pub old_status: TaskStatus,
    pub new_status: TaskStatus,
    pub task: Task,
}

/// Payload of a `task.deleted` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletedPayload {
    pub id: String,
}

/// Payload of a `task.response_created` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseCreatedPayload {
    pub task_id: String,
    pub response: ConversationMessage,
}

impl Event {
    pub fn new(event_type: &str, data: Value, scope: &str) -> Self {
        Self {
            event_type: event_type.to_string(),
            data,
            timestamp: Utc::now(),
            scope: scope.to_string(),
        }
    }

    pub fn task_created(task: &Task) -> Self {
        Self::new(
            types::TASK_CREATED,
            serde_json::to_value(task).unwrap_or_default(),
            scopes::TASKS,
        )
    }

    pub fn task_updated(task: &Task) -> Self {
        Self::new(
            types::TASK_UPDATED,
            serde_json::to_value(task).unwrap_or_default(),
            scopes::TASKS,
        )
    }

    pub fn status_changed(old_status: TaskStatus, task: &Task) -> Self {
        let payload = StatusChangedPayload {
            id: task.id.clone(),
            old_status,
            new_status: task.status,
            task: task.clone(),
        };
        Self::new(
            types::TASK_STATUS_CHANGED,
            serde_json::to_value(&payload).unwrap_or_default(),
            scopes::TASKS,
        )
    }

    pub fn task_deleted(id: &str) -> Self {
        Self::new(
            types::TASK_DELETED,
            serde_json::json!({ "id": id }),
            scopes::TASKS,
        )
    }

    pub fn response_created(response: &ConversationMessage) -> Self {
        let payload = ResponseCreatedPayload {
            task_id: response.task_id.clone(),
            response: response.clone(),
        };
        Self::new(
            types::RESPONSE_CREATED,
            serde_json::to_value(&payload).unwrap_or_default(),
            scopes::CONVERSATIONS,
        )
    }

    pub fn heartbeat() -> Self {
        Self::new(types::HEARTBEAT, Value::Null, scopes::SYSTEM)
    }

    pub fn is_heartbeat(&self) -> bool {
        self.event_type == types::HEARTBEAT
    }

    /// Parse an inbound text frame. Malformed frames are a `Protocol` error —
    /// the caller drops them with a logged warning, never feeds them to
    /// handlers.
    pub fn parse(text: &str) -> Result<Self, SyncError> {
        let event: Event = serde_json::from_str(text)
            .map_err(|e| SyncError::Protocol(format!("malformed event frame: {e}")))?;
        if event.event_type.is_empty() {
            return Err(SyncError::Protocol("event frame with empty type".to_string()));
        }
        Ok(event)
    }

    /// Serialize to a wire frame.
    pub fn to_frame(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
