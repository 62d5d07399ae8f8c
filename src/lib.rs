pub mod board;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod domain;
pub mod errors;
pub mod events;
pub mod server;

use std::sync::Arc;

use broadcast::EventBroadcaster;
use config::DaemonConfig;

/// Shared application state, owned by the composition root and passed by
/// reference to every component that needs it. No global registries — tests
/// run multiple independent instances side by side.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<DaemonConfig>,
    pub broadcaster: Arc<EventBroadcaster>,
    pub started_at: std::time::Instant,
}

impl AppContext {
    pub fn new(config: DaemonConfig) -> Self {
        let broadcaster = Arc::new(EventBroadcaster::new(config.sync.queue_capacity));
        Self {
            config: Arc::new(config),
            broadcaster,
            started_at: std::time::Instant::now(),
        }
    }
}
