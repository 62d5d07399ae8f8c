//! Event handler registry: maps event type to an ordered callback list.
//!
//! Registering the wildcard type `"*"` receives every dispatched event after
//! the type-specific handlers. Duplicate registrations are kept — the caller
//! is responsible for idempotence if it needs it.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::warn;

use crate::events::{types, Event};

/// Identifies one registration, for later removal with [`HandlerRegistry::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Vec<(HandlerId, Handler)>>>,
    next_id: AtomicU64,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `handler` to the list for `event_type`. Returns the id to pass
    /// to [`off`](Self::off) to unsubscribe.
    pub fn on(
        &self,
        event_type: &str,
        handler: impl Fn(&Event) + Send + Sync + 'static,
    ) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .entry(event_type.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove one specific registration. Returns whether it was found.
    pub fn off(&self, event_type: &str, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(|p| p.into_inner());
        if let Some(list) = handlers.get_mut(event_type) {
            let before = list.len();
            list.retain(|(hid, _)| *hid != id);
            return list.len() != before;
        }
        false
    }

    /// Invoke all handlers registered for the event's type in registration
    /// order, then all wildcard handlers. A panicking handler is caught and
    /// logged; the remaining handlers still run. Dispatching an event with
    /// no registered handlers is a no-op.
    pub fn dispatch(&self, event: &Event) {
        // Snapshot under the read lock so handlers may register/unregister
        // re-entrantly without deadlocking.
        let to_run: Vec<(HandlerId, Handler)> = {
            let handlers = self.handlers.read().unwrap_or_else(|p| p.into_inner());
            let typed = handlers.get(&event.event_type).into_iter().flatten();
            let wildcard = handlers.get(types::WILDCARD).into_iter().flatten();
            typed.chain(wildcard).cloned().collect()
        };

        for (id, handler) in to_run {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                warn!(
                    handler = id.0,
                    event_type = %event.event_type,
                    "handler panicked — continuing dispatch"
                );
            }
        }
    }

    /// Number of handlers registered for `event_type` (wildcard excluded).
    pub fn handler_count(&self, event_type: &str) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(event_type)
            .map(|l| l.len())
            .unwrap_or(0)
    }
}
