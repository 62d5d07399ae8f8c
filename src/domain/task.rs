//! Task model and status state machine.
//!
//! Pure domain logic — no I/O. Every client renders task affordances from
//! these guards against the *current* status field, never from a cached
//! previous state, so transitions are enforced identically everywhere.

use serde::{Deserialize, Serialize};

use crate::errors::SyncError;

/// The finite set of states a task can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Done,
}

impl TaskStatus {
    /// Board column order: pending, in_progress, done.
    pub const ALL: [TaskStatus; 3] = [TaskStatus::Pending, TaskStatus::InProgress, TaskStatus::Done];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-task conversation summary, rendered as a badge without loading the
/// full thread.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseSummary {
    pub unread_count: u32,
    pub total_responses: u32,
    pub last_response: Option<String>,
}

/// A work item on the board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub assignee_id: Option<String>,
    pub creator_id: String,
    pub tag_id: String,
    /// Present on subtasks. A subtask's status chip is independent of its
    /// parent's column placement.
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub summary: ResponseSummary,
}

impl Task {
    pub fn is_subtask(&self) -> bool {
        self.parent_id.is_some()
    }

    pub fn is_creator(&self, user_id: &str) -> bool {
        self.creator_id == user_id
    }

    pub fn is_assignee(&self, user_id: &str) -> bool {
        self.assignee_id.as_deref() == Some(user_id)
    }
}

/// Status-changing actions a user can take on a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    /// pending → in_progress
    Start,
    /// in_progress → done
    Complete,
    /// in_progress → pending
    ReturnToPending,
    /// done → in_progress; permitted only for the task's creator.
    Reopen,
}

/// Pure transition function: apply one action to the task's current status
/// and return the new status. Returns `Err` if the transition is invalid or
/// the actor lacks the right to make it.
pub fn apply_action(task: &Task, action: TaskAction, actor_id: &str) -> Result<TaskStatus, SyncError> {
    match (action, task.status) {
        (TaskAction::Start, TaskStatus::Pending) => Ok(TaskStatus::InProgress),
        (TaskAction::Complete, TaskStatus::InProgress) => Ok(TaskStatus::Done),
        (TaskAction::ReturnToPending, TaskStatus::InProgress) => Ok(TaskStatus::Pending),
        (TaskAction::Reopen, TaskStatus::Done) => {
            if task.is_creator(actor_id) {
                Ok(TaskStatus::InProgress)
            } else {
                Err(SyncError::Authorization(
                    "only the task creator may reopen a done task".to_string(),
                ))
            }
        }
        (action, status) => Err(SyncError::Validation(format!(
            "invalid transition: {action:?} from {status}"
        ))),
    }
}

/// The actions currently offered to `actor_id`, in render order.
///
/// Recomputed from the current status on every applied event.
pub fn available_actions(task: &Task, actor_id: &str) -> Vec<TaskAction> {
    let mut actions = Vec::new();
    match task.status {
        TaskStatus::Pending => actions.push(TaskAction::Start),
        TaskStatus::InProgress => {
            actions.push(TaskAction::Complete);
            actions.push(TaskAction::ReturnToPending);
        }
        TaskStatus::Done => {
            if task.is_creator(actor_id) {
                actions.push(TaskAction::Reopen);
            }
        }
    }
    actions
}

/// Whether `actor_id` may create a subtask under this task right now.
///
/// Permitted while in_progress for the creator or assignee; while pending
/// only when an assignee is already set (and the actor is creator or
/// assignee). Never once the task is done.
pub fn can_create_subtask(task: &Task, actor_id: &str) -> bool {
    let involved = task.is_creator(actor_id) || task.is_assignee(actor_id);
    match task.status {
        TaskStatus::InProgress => involved,
        TaskStatus::Pending => task.assignee_id.is_some() && involved,
        TaskStatus::Done => false,
    }
}

/// Whether the conversation affordance is visible for a task in `status`.
/// A pending task has no visible conversation.
pub fn conversation_visible(status: TaskStatus) -> bool {
    matches!(status, TaskStatus::InProgress | TaskStatus::Done)
}

// ─── Transfer ────────────────────────────────────────────────────────────────

/// A candidate assignee for a given tag, as returned by the collaborator's
/// candidate-list fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub name: String,
}

/// Client-side pre-flight check for a transfer request. Runs before any
/// network call: the chosen assignee must appear in the most recently
/// fetched candidate list for the chosen tag.
pub fn validate_transfer(
    assignee_id: &str,
    tag_id: Option<&str>,
    candidates: &[Candidate],
) -> Result<(), SyncError> {
    let tag_id = tag_id.ok_or_else(|| SyncError::Validation("no tag selected".to_string()))?;
    if candidates.is_empty() {
        return Err(SyncError::Validation(format!(
            "no candidate assignees for tag '{tag_id}'"
        )));
    }
    if !candidates.iter().any(|c| c.id == assignee_id) {
        return Err(SyncError::Validation(format!(
            "assignee '{assignee_id}' is not a candidate for tag '{tag_id}'"
        )));
    }
    Ok(())
}

/// Apply a confirmed transfer: assignee and tag change together, atomically.
pub fn apply_transfer(task: &mut Task, assignee_id: &str, tag_id: &str) {
    task.assignee_id = Some(assignee_id.to_string());
    task.tag_id = tag_id.to_string();
}

// ─── Summary reducer ─────────────────────────────────────────────────────────

/// Badge-affecting events, reduced through one function instead of mutating
/// counters at every call site.
#[derive(Debug, Clone)]
pub enum SummaryEvent {
    /// A conversation message arrived while the thread view was closed.
    ResponseArrived { preview: String },
    /// A conversation message arrived while the thread view was open —
    /// it is read immediately, so only the totals move.
    ResponseSeen { preview: String },
    /// The participant opened or caught up on the thread.
    ThreadRead,
    /// Authoritative counts from a full thread (re)load.
    ThreadLoaded {
        unread: u32,
        total: u32,
        last: Option<String>,
    },
}

/// Pure reducer: current summary + event → next summary.
/// `unread_count` never goes below zero.
pub fn reduce_summary(summary: &ResponseSummary, event: &SummaryEvent) -> ResponseSummary {
    match event {
        SummaryEvent::ResponseArrived { preview } => ResponseSummary {
            unread_count: summary.unread_count + 1,
            total_responses: summary.total_responses + 1,
            last_response: Some(preview.clone()),
        },
        SummaryEvent::ResponseSeen { preview } => ResponseSummary {
            unread_count: summary.unread_count,
            total_responses: summary.total_responses + 1,
            last_response: Some(preview.clone()),
        },
        SummaryEvent::ThreadRead => ResponseSummary {
            unread_count: 0,
            total_responses: summary.total_responses,
            last_response: summary.last_response.clone(),
        },
        SummaryEvent::ThreadLoaded { unread, total, last } => ResponseSummary {
            unread_count: *unread,
            total_responses: *total,
            last_response: last.clone(),
        },
    }
}
