//! Pure domain logic: task state machine and conversation threads.
//!
//! Nothing in this module performs I/O. Tasks and messages are owned by the
//! persistence collaborator — the engine only observes and reacts to change
//! notifications about them.

pub mod task;
pub mod thread;

pub use task::{
    apply_action, apply_transfer, available_actions, can_create_subtask, conversation_visible,
    reduce_summary, validate_transfer, Candidate, ResponseSummary, SummaryEvent, Task, TaskAction,
    TaskStatus,
};
pub use thread::{ConversationMessage, ConversationThread, ReadMarker};
