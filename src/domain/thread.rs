//! Per-task conversation thread: append-only message log with per-participant
//! read markers and unread counters.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::ResponseSummary;

/// One message in a task's conversation. Ordering is creation order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: String,
    pub task_id: String,
    pub author_id: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl ConversationMessage {
    pub fn new(task_id: &str, author_id: &str, body: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            author_id: author_id.to_string(),
            body: body.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Per-participant pointer to the last message that participant has seen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadMarker {
    pub last_read_message_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only conversation log for one task.
///
/// The thread itself knows nothing about task status — the caller enforces
/// the visibility guard (`conversation_visible`) before posting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationThread {
    pub task_id: String,
    messages: Vec<ConversationMessage>,
    markers: HashMap<String, ReadMarker>,
}

impl ConversationThread {
    pub fn new(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            messages: Vec::new(),
            markers: HashMap::new(),
        }
    }

    pub fn messages(&self) -> &[ConversationMessage] {
        &self.messages
    }

    pub fn total(&self) -> u32 {
        self.messages.len() as u32
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn message(&self, id: &str) -> Option<&ConversationMessage> {
        self.messages.iter().find(|m| m.id == id)
    }

    /// Append an already-constructed message, as received from a broadcast
    /// event. The author's marker advances the same way `post` does.
    pub fn append(&mut self, message: ConversationMessage) {
        let author = message.author_id.clone();
        let id = message.id.clone();
        self.messages.push(message);
        self.markers.insert(
            author,
            ReadMarker {
                last_read_message_id: Some(id),
                updated_at: Utc::now(),
            },
        );
    }

    /// Append a message. The author's own marker advances to the new message
    /// so every participant's unread count moves except the author's.
    pub fn post(&mut self, author_id: &str, body: &str) -> &ConversationMessage {
        let message = ConversationMessage::new(&self.task_id, author_id, body);
        let id = message.id.clone();
        self.messages.push(message);
        self.markers.insert(
            author_id.to_string(),
            ReadMarker {
                last_read_message_id: Some(id),
                updated_at: Utc::now(),
            },
        );
        self.messages.last().unwrap()
    }

    /// Advance `user_id`'s read marker to the latest message.
    pub fn mark_read(&mut self, user_id: &str) {
        let last_id = self.messages.last().map(|m| m.id.clone());
        self.markers.insert(
            user_id.to_string(),
            ReadMarker {
                last_read_message_id: last_id,
                updated_at: Utc::now(),
            },
        );
    }

    /// Messages after `user_id`'s marker, excluding the user's own. Always ≥ 0.
    pub fn unread_count(&self, user_id: &str) -> u32 {
        let start = self
            .markers
            .get(user_id)
            .and_then(|m| m.last_read_message_id.as_deref())
            .and_then(|id| self.messages.iter().position(|msg| msg.id == id))
            .map(|pos| pos + 1)
            .unwrap_or(0);

        self.messages[start..]
            .iter()
            .filter(|m| m.author_id != user_id)
            .count() as u32
    }

    /// Badge summary for `user_id`, rendered without loading the full thread.
    pub fn summary_for(&self, user_id: &str) -> ResponseSummary {
        ResponseSummary {
            unread_count: self.unread_count(user_id),
            total_responses: self.total(),
            last_response: self.messages.last().map(|m| m.body.clone()),
        }
    }
}
