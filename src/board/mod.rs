//! Board reconciler: applies dispatched events to the rendered board.
//!
//! The board is mutated on two paths that may carry the same logical change:
//! an optimistic local update applied immediately on user action, and the
//! broadcast echo of that change arriving later over the stream. Every
//! mutation therefore looks the target card up by entity id before inserting,
//! and re-application of an identical event is a no-op.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

use crate::domain::{
    available_actions, can_create_subtask, conversation_visible, reduce_summary,
    ConversationMessage, ConversationThread, SummaryEvent, Task, TaskAction, TaskStatus,
};
use crate::errors::SyncError;
use crate::events::{
    types, DeletedPayload, Event, ResponseCreatedPayload, StatusChangedPayload,
};

/// One rendered card, with the affordances the viewer currently sees.
///
/// Affordances are recomputed from the task's current status on every applied
/// event, never carried over from a previous state.
#[derive(Debug, Clone, PartialEq)]
pub struct Card {
    pub task: Task,
    pub actions: Vec<TaskAction>,
    pub can_add_subtask: bool,
    pub conversation_visible: bool,
}

impl Card {
    fn new(task: Task, viewer_id: &str) -> Self {
        let actions = available_actions(&task, viewer_id);
        let can_add_subtask = can_create_subtask(&task, viewer_id);
        let conversation = conversation_visible(task.status);
        Self {
            task,
            actions,
            can_add_subtask,
            conversation_visible: conversation,
        }
    }
}

/// One status column. An empty column shows exactly one placeholder element.
#[derive(Debug, Default)]
pub struct Column {
    cards: Vec<Card>,
    shows_placeholder: bool,
}

impl Column {
    pub fn cards(&self) -> &[Card] {
        &self.cards
    }

    pub fn shows_placeholder(&self) -> bool {
        self.shows_placeholder
    }

    fn refresh_placeholder(&mut self) {
        self.shows_placeholder = self.cards.is_empty();
    }
}

/// The conversation drawer, open on at most one task at a time.
#[derive(Debug)]
pub struct Drawer {
    pub task_id: String,
    pub thread: ConversationThread,
}

/// Rendered board state: one column per status, plus the drawer.
pub struct Board {
    viewer_id: String,
    columns: BTreeMap<TaskStatus, Column>,
    drawer: Option<Drawer>,
}

impl Board {
    pub fn new(viewer_id: &str) -> Self {
        let mut columns = BTreeMap::new();
        for status in TaskStatus::ALL {
            let mut column = Column::default();
            column.refresh_placeholder();
            columns.insert(status, column);
        }
        Self {
            viewer_id: viewer_id.to_string(),
            columns,
            drawer: None,
        }
    }

    pub fn column(&self, status: TaskStatus) -> &Column {
        &self.columns[&status]
    }

    /// Locate a card by entity id, wherever it currently renders.
    pub fn find_card(&self, id: &str) -> Option<&Card> {
        self.columns
            .values()
            .flat_map(|c| c.cards.iter())
            .find(|card| card.task.id == id)
    }

    pub fn drawer(&self) -> Option<&Drawer> {
        self.drawer.as_ref()
    }

    /// Open the conversation drawer for a task, loading the given thread and
    /// marking it read for the viewer.
    pub fn open_drawer(&mut self, task_id: &str, mut thread: ConversationThread) {
        thread.mark_read(&self.viewer_id);
        if let Some(card) = self.find_card_mut(task_id) {
            card.task.summary = reduce_summary(&card.task.summary, &SummaryEvent::ThreadRead);
        }
        self.drawer = Some(Drawer {
            task_id: task_id.to_string(),
            thread,
        });
    }

    /// Deep link: open the drawer for a task by id with a fresh thread.
    /// Returns false when the task is not on the board or its conversation
    /// is not visible (pending tasks have none).
    pub fn open_for_task(&mut self, task_id: &str) -> bool {
        let Some(card) = self.find_card(task_id) else {
            return false;
        };
        if !conversation_visible(card.task.status) {
            return false;
        }
        self.open_drawer(task_id, ConversationThread::new(task_id));
        true
    }

    pub fn close_drawer(&mut self) {
        self.drawer = None;
    }

    /// Replace every card from a fresh fetch. Recovery path after missed
    /// events or an unrecoverable failure.
    pub fn reset_from(&mut self, tasks: Vec<Task>) {
        for column in self.columns.values_mut() {
            column.cards.clear();
        }
        for task in tasks {
            let status = task.status;
            let card = Card::new(task, &self.viewer_id);
            if let Some(column) = self.columns.get_mut(&status) {
                column.cards.push(card);
            }
        }
        for column in self.columns.values_mut() {
            column.refresh_placeholder();
        }
    }

    /// Apply one dispatched event. Unknown event types are ignored; a payload
    /// that does not deserialize is a `Protocol` error.
    pub fn apply(&mut self, event: &Event) -> Result<(), SyncError> {
        match event.event_type.as_str() {
            types::TASK_CREATED => {
                let task = decode(&event.data)?;
                self.apply_created(task);
            }
            types::TASK_STATUS_CHANGED => {
                let payload: StatusChangedPayload = decode(&event.data)?;
                self.apply_status_changed(payload);
            }
            types::TASK_DELETED => {
                let payload: DeletedPayload = decode(&event.data)?;
                self.apply_deleted(&payload.id);
            }
            types::TASK_UPDATED => {
                let task = decode(&event.data)?;
                self.apply_updated(task);
            }
            types::RESPONSE_CREATED => {
                let payload: ResponseCreatedPayload = decode(&event.data)?;
                self.apply_response_created(payload.task_id, payload.response);
            }
            other => {
                debug!(event_type = other, "board ignoring event type");
            }
        }
        Ok(())
    }

    fn apply_created(&mut self, task: Task) {
        // The optimistic insert may already have happened; upsert by id.
        if self.find_card(&task.id).is_some() {
            self.apply_updated(task);
            return;
        }
        let status = task.status;
        let card = Card::new(task, &self.viewer_id);
        let column = self
            .columns
            .get_mut(&status)
            .unwrap_or_else(|| unreachable!("column exists for every status"));
        column.cards.insert(0, card);
        column.refresh_placeholder();
    }

    fn apply_status_changed(&mut self, payload: StatusChangedPayload) {
        if payload.task.is_subtask() {
            // Subtasks keep their place; only the status chip and affordances
            // change.
            let viewer_id = self.viewer_id.clone();
            if let Some(card) = self.find_card_mut(&payload.id) {
                *card = Card::new(payload.task, &viewer_id);
            }
            return;
        }

        // Remove from wherever the card actually renders, which is not
        // necessarily old_status if this is the echo of an optimistic move.
        let Some(current) = self.current_status(&payload.id) else {
            // Filtered out of this view.
            return;
        };
        let replacement = Card::new(payload.task, &self.viewer_id);
        if current == payload.new_status {
            // Echo of a change already applied; patch fields only.
            if let Some(card) = self.find_card_mut(&payload.id) {
                if *card != replacement {
                    *card = replacement;
                }
            }
            return;
        }

        let old_column = self
            .columns
            .get_mut(&current)
            .unwrap_or_else(|| unreachable!("column exists for every status"));
        old_column.cards.retain(|c| c.task.id != payload.id);
        old_column.refresh_placeholder();

        let new_column = self
            .columns
            .get_mut(&payload.new_status)
            .unwrap_or_else(|| unreachable!("column exists for every status"));
        new_column.cards.insert(0, replacement);
        new_column.refresh_placeholder();
    }

    fn apply_deleted(&mut self, id: &str) {
        for column in self.columns.values_mut() {
            let before = column.cards.len();
            column.cards.retain(|c| c.task.id != id);
            if column.cards.len() != before {
                column.refresh_placeholder();
            }
        }
        if self.drawer.as_ref().is_some_and(|d| d.task_id == id) {
            self.drawer = None;
        }
    }

    fn apply_updated(&mut self, task: Task) {
        // Patch displayed fields in place without relocating the card.
        let viewer_id = self.viewer_id.clone();
        if let Some(card) = self.find_card_mut(&task.id) {
            let replacement = Card::new(task, &viewer_id);
            if *card != replacement {
                *card = replacement;
            }
        }
    }

    fn apply_response_created(&mut self, task_id: String, response: ConversationMessage) {
        let viewer_is_author = response.author_id == self.viewer_id;
        let drawer_open = self
            .drawer
            .as_ref()
            .is_some_and(|d| d.task_id == task_id);

        if drawer_open {
            let preview = response.body.clone();
            if let Some(drawer) = self.drawer.as_mut() {
                // The echo of the viewer's own optimistic post carries the
                // same message id; skip the duplicate.
                if drawer.thread.message(&response.id).is_none() {
                    drawer.thread.append(response);
                }
                drawer.thread.mark_read(&self.viewer_id);
            }
            if let Some(card) = self.find_card_mut(&task_id) {
                card.task.summary =
                    reduce_summary(&card.task.summary, &SummaryEvent::ResponseSeen { preview });
            }
        } else if let Some(card) = self.find_card_mut(&task_id) {
            let event = if viewer_is_author {
                SummaryEvent::ResponseSeen {
                    preview: response.body,
                }
            } else {
                SummaryEvent::ResponseArrived {
                    preview: response.body,
                }
            };
            card.task.summary = reduce_summary(&card.task.summary, &event);
        }
    }

    fn find_card_mut(&mut self, id: &str) -> Option<&mut Card> {
        self.columns
            .values_mut()
            .flat_map(|c| c.cards.iter_mut())
            .find(|card| card.task.id == id)
    }

    fn current_status(&self, id: &str) -> Option<TaskStatus> {
        self.columns
            .iter()
            .find(|(_, column)| column.cards.iter().any(|c| c.task.id == id))
            .map(|(status, _)| *status)
    }
}

fn decode<T: serde::de::DeserializeOwned>(data: &Value) -> Result<T, SyncError> {
    serde_json::from_value(data.clone())
        .map_err(|e| SyncError::Protocol(format!("malformed event payload: {e}")))
}
