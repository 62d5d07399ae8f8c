//! Mutation boundary to the persistence collaborator.
//!
//! Record persistence and authorization live outside this crate; mutations
//! are request/response calls returning a structured outcome. Domain
//! rejections (authorization/validation) surface to the user with no retry;
//! an unexpected failure falls back to a full board refetch
//! (`recover_board`) rather than fine-grained repair.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::board::Board;
use crate::domain::{
    validate_transfer, Candidate, ConversationMessage, ResponseSummary, Task, TaskAction,
};
use crate::errors::SyncError;

/// Structured result of a mutation call: `{success, entity, meta}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResult<T> {
    pub success: bool,
    pub entity: T,
    #[serde(default)]
    pub meta: Value,
}

/// Request/response operations implemented against the out-of-scope
/// persistence collaborator and injected at the composition root.
#[async_trait]
pub trait BoardApi: Send + Sync {
    async fn change_status(
        &self,
        task_id: &str,
        action: TaskAction,
        actor_id: &str,
    ) -> Result<ApiResult<Task>, SyncError>;

    async fn delete_task(&self, task_id: &str, actor_id: &str)
        -> Result<ApiResult<Task>, SyncError>;

    /// Transfer assignee and tag together, atomically.
    async fn transfer(
        &self,
        task_id: &str,
        assignee_id: &str,
        tag_id: &str,
    ) -> Result<ApiResult<Task>, SyncError>;

    async fn post_response(
        &self,
        task_id: &str,
        author_id: &str,
        body: &str,
    ) -> Result<ApiResult<ConversationMessage>, SyncError>;

    async fn mark_read(
        &self,
        task_id: &str,
        user_id: &str,
    ) -> Result<ApiResult<ResponseSummary>, SyncError>;

    /// Candidate assignees for a tag; feeds the transfer pre-flight check.
    async fn fetch_candidates(&self, tag_id: &str) -> Result<Vec<Candidate>, SyncError>;

    /// Full state refetch — the recovery path for missed events and
    /// unrecoverable mutation failures.
    async fn refetch_board(&self) -> Result<Vec<Task>, SyncError>;
}

// ─── Transfer panel ──────────────────────────────────────────────────────────

/// UI-side state for the transfer dialog.
///
/// Awaiting the candidate fetch and awaiting the transfer acknowledgment are
/// the suspension points where controls must be disabled; the
/// `fetching`/`submitting` flags are that disabled state, so re-entrant
/// duplicate submissions are impossible.
#[derive(Default)]
pub struct TransferPanel {
    selected_tag: Option<String>,
    candidates: Vec<Candidate>,
    fetching: bool,
    submitting: bool,
}

impl TransferPanel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    pub fn selected_tag(&self) -> Option<&str> {
        self.selected_tag.as_deref()
    }

    pub fn is_busy(&self) -> bool {
        self.fetching || self.submitting
    }

    /// Select a tag and fetch its candidate list.
    pub async fn select_tag(&mut self, api: &dyn BoardApi, tag_id: &str) -> Result<(), SyncError> {
        if self.is_busy() {
            return Err(SyncError::Validation(
                "a candidate fetch is already in progress".to_string(),
            ));
        }
        self.fetching = true;
        let result = api.fetch_candidates(tag_id).await;
        self.fetching = false;

        match result {
            Ok(candidates) => {
                self.selected_tag = Some(tag_id.to_string());
                self.candidates = candidates;
                Ok(())
            }
            Err(e) => {
                self.selected_tag = None;
                self.candidates.clear();
                Err(e)
            }
        }
    }

    /// Submit the transfer. The pre-flight check runs against the most
    /// recently fetched candidate list *before* any network call.
    pub async fn submit(
        &mut self,
        api: &dyn BoardApi,
        task_id: &str,
        assignee_id: &str,
    ) -> Result<ApiResult<Task>, SyncError> {
        if self.is_busy() {
            return Err(SyncError::Validation(
                "a transfer is already in progress".to_string(),
            ));
        }
        validate_transfer(assignee_id, self.selected_tag.as_deref(), &self.candidates)?;

        // The guard above proves selected_tag is set.
        let tag_id = self.selected_tag.clone().unwrap_or_default();
        self.submitting = true;
        let result = api.transfer(task_id, assignee_id, &tag_id).await;
        self.submitting = false;
        result
    }
}

// ─── Recovery ────────────────────────────────────────────────────────────────

/// Conservative fallback after an unrecoverable sync failure: replace the
/// whole board from a fresh fetch instead of attempting in-place repair.
pub async fn recover_board(api: &dyn BoardApi, board: &mut Board) -> Result<(), SyncError> {
    let tasks = api.refetch_board().await?;
    board.reset_from(tasks);
    Ok(())
}
