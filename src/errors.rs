//! Error taxonomy for the sync engine.
//!
//! The propagation policy is split in two: transport-layer failures
//! (`Transport`, `Protocol`, `Handler`) are recovered locally — the reconnect
//! state machine or the dispatch loop absorbs them — while domain-level
//! rejections (`Authorization`, `Validation`) surface directly to the UI
//! with no automatic retry. `Unrecoverable` is the conservative last resort:
//! a mutation failed in a way we cannot repair in place, so the caller must
//! refetch the full board state.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Connection drop, heartbeat timeout, failed dial. Recovered
    /// automatically by the reconnect-with-backoff state machine.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed event frame. Dropped and logged; never reaches handlers.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A registered callback panicked. Caught and logged per handler;
    /// dispatch of the same event to other handlers continues.
    #[error("handler panicked while processing '{event_type}'")]
    Handler { event_type: String },

    /// A mutation was rejected by the authorization collaborator.
    #[error("not authorized: {0}")]
    Authorization(String),

    /// A mutation was rejected by a domain guard (invalid transition,
    /// transfer to an unknown assignee, posting to a hidden conversation).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A mutation failed unexpectedly. The only safe recovery is a full
    /// refetch of board state.
    #[error("unrecoverable sync failure: {0}")]
    Unrecoverable(String),
}

impl SyncError {
    /// True when the error is absorbed by the transport/dispatch layer and
    /// must never be shown to the end user as a failure.
    pub fn recovered_locally(&self) -> bool {
        matches!(
            self,
            SyncError::Transport(_) | SyncError::Protocol(_) | SyncError::Handler { .. }
        )
    }

    /// True when the error is a domain rejection that the UI surfaces
    /// directly, with no retry.
    pub fn surfaces_to_user(&self) -> bool {
        matches!(self, SyncError::Authorization(_) | SyncError::Validation(_))
    }

    /// True when the caller should fall back to a full board refetch.
    pub fn requires_refetch(&self) -> bool {
        matches!(self, SyncError::Unrecoverable(_))
    }
}
