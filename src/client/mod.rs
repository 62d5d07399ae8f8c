//! Client runtime: connection lifecycle, frame parsing, and dispatch.
//!
//! The transport client owns one streaming connection. On transport error or
//! server close it reconnects with a linear capped backoff
//! (`min(base_ms * attempt, cap_ms)`); `disconnect()` is the only
//! cancellation primitive and also cancels a pending scheduled reconnect.
//! Dispatch is synchronous and single-threaded per connection: handlers for
//! one frame complete before the next frame is dispatched.

pub mod api;
pub mod registry;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, trace, warn};

use crate::config::ReconnectConfig;
use crate::errors::SyncError;
use crate::events::Event;
pub use registry::{HandlerId, HandlerRegistry};

// ─── Connection state machine ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

/// Notifications delivered to connection-state listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum StateChange {
    Connected,
    Disconnected,
    Error { reason: String },
    Reconnecting { attempt: u32, delay: Duration },
    Failed { attempts: u32 },
}

/// Delay before the Nth consecutive reconnect attempt.
pub fn reconnect_delay(policy: &ReconnectConfig, attempt: u32) -> Duration {
    let ms = policy.base_ms.saturating_mul(attempt as u64).min(policy.cap_ms);
    Duration::from_millis(ms)
}

/// Identifies one connection-state listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

type StateListener = Arc<dyn Fn(&StateChange) + Send + Sync>;

struct ClientShared {
    state: Mutex<ConnectionState>,
    /// Serializes transition + notify pairs so a connection loop racing
    /// `disconnect()` can never overwrite `Disconnected` or emit a state
    /// change after the `Disconnected` notification.
    transitions: Mutex<()>,
    /// Bumped by `connect()` and `disconnect()`; a loop whose generation is
    /// stale makes no further transitions.
    generation: AtomicU64,
    listeners: RwLock<Vec<(u64, StateListener)>>,
    next_listener_id: AtomicU64,
    registry: Arc<HandlerRegistry>,
}

impl ClientShared {
    fn set_state(&self, next: ConnectionState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = next;
    }

    fn notify(&self, change: &StateChange) {
        let listeners: Vec<StateListener> = self
            .listeners
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(change);
        }
    }

    /// Transition on behalf of the connection loop for generation `gen`.
    /// Returns false (and does nothing) when the generation is stale, which
    /// means `disconnect()` or a newer `connect()` has superseded the loop.
    fn transition_if(&self, gen: u64, next: ConnectionState, change: &StateChange) -> bool {
        let _order = self.transitions.lock().unwrap_or_else(|p| p.into_inner());
        if self.generation.load(Ordering::SeqCst) != gen {
            return false;
        }
        self.set_state(next);
        self.notify(change);
        true
    }

    /// Notify without a state change, subject to the same generation guard.
    fn notify_if(&self, gen: u64, change: &StateChange) -> bool {
        let _order = self.transitions.lock().unwrap_or_else(|p| p.into_inner());
        if self.generation.load(Ordering::SeqCst) != gen {
            return false;
        }
        self.notify(change);
        true
    }
}

// ─── Transport client ────────────────────────────────────────────────────────

pub struct TransportClient {
    url: String,
    scopes: Vec<String>,
    policy: ReconnectConfig,
    shared: Arc<ClientShared>,
    shutdown: Mutex<Option<broadcast::Sender<()>>>,
}

impl TransportClient {
    pub fn new(
        url: &str,
        scopes: &[String],
        policy: ReconnectConfig,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        Self {
            url: url.to_string(),
            scopes: scopes.to_vec(),
            policy,
            shared: Arc::new(ClientShared {
                state: Mutex::new(ConnectionState::Disconnected),
                transitions: Mutex::new(()),
                generation: AtomicU64::new(0),
                listeners: RwLock::new(Vec::new()),
                next_listener_id: AtomicU64::new(0),
                registry,
            }),
            shutdown: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.shared.registry
    }

    /// Register an event handler. See [`HandlerRegistry::on`].
    pub fn on(&self, event_type: &str, handler: impl Fn(&Event) + Send + Sync + 'static) -> HandlerId {
        self.shared.registry.on(event_type, handler)
    }

    /// Remove an event handler. See [`HandlerRegistry::off`].
    pub fn off(&self, event_type: &str, id: HandlerId) -> bool {
        self.shared.registry.off(event_type, id)
    }

    /// Register a connection-state listener.
    pub fn on_connection_state(
        &self,
        listener: impl Fn(&StateChange) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = self.shared.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.shared
            .listeners
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push((id, Arc::new(listener)));
        ListenerId(id)
    }

    pub fn off_connection_state(&self, id: ListenerId) {
        self.shared
            .listeners
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .retain(|(lid, _)| *lid != id.0);
    }

    /// Open the connection. Only valid from `Disconnected` or `Failed`.
    ///
    /// Spawns the background connection loop; lifecycle progress is reported
    /// through connection-state listeners.
    pub fn connect(&self) -> Result<(), SyncError> {
        {
            let mut state = self.shared.state.lock().unwrap_or_else(|p| p.into_inner());
            match *state {
                ConnectionState::Disconnected | ConnectionState::Failed => {}
                other => {
                    return Err(SyncError::Validation(format!(
                        "connect() is only valid from Disconnected or Failed (currently {other:?})"
                    )))
                }
            }
            *state = ConnectionState::Connecting;
        }

        let gen = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        *self.shutdown.lock().unwrap_or_else(|p| p.into_inner()) = Some(shutdown_tx);

        tokio::spawn(run_loop(
            self.shared.clone(),
            self.url.clone(),
            self.scopes.clone(),
            self.policy.clone(),
            shutdown_rx,
            gen,
        ));
        Ok(())
    }

    /// Close the connection, cancel any pending scheduled reconnect, and
    /// reset the attempt counter. Terminal until `connect()` is called again.
    ///
    /// Page/component teardown must call this — a leaked reconnect loop would
    /// keep dialing after the UI that depends on it is gone.
    pub fn disconnect(&self) {
        let tx = self.shutdown.lock().unwrap_or_else(|p| p.into_inner()).take();
        if tx.is_none() && self.state() == ConnectionState::Disconnected {
            return;
        }
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
        // Invalidate the loop's generation and land on Disconnected under
        // the same ordering lock the loop's transitions take, so a loop that
        // raced past the shutdown signal cannot overwrite this state.
        let _order = self
            .shared
            .transitions
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.shared.set_state(ConnectionState::Disconnected);
        self.shared.notify(&StateChange::Disconnected);
    }
}

// ─── Connection loop ─────────────────────────────────────────────────────────

enum ReadEnd {
    /// `disconnect()` was called — exit without further notifications.
    Shutdown,
    /// The channel dropped; carry the reason into the Error notification.
    Closed(String),
}

async fn run_loop(
    shared: Arc<ClientShared>,
    url: String,
    scopes: Vec<String>,
    policy: ReconnectConfig,
    mut shutdown: broadcast::Receiver<()>,
    gen: u64,
) {
    let mut attempt: u32 = 0;

    loop {
        // Dial, racing shutdown so disconnect() during a slow dial wins.
        let conn = tokio::select! {
            _ = shutdown.recv() => return,
            c = connect_async(&url) => c,
        };

        match conn {
            Ok((ws, _)) => {
                let (mut sink, mut stream) = ws.split();
                let subscribe =
                    serde_json::json!({ "type": "subscribe", "scopes": scopes }).to_string();

                if sink.send(Message::Text(subscribe)).await.is_ok() {
                    attempt = 0;
                    if !shared.transition_if(gen, ConnectionState::Connected, &StateChange::Connected)
                    {
                        return;
                    }
                    info!(url = %url, "connected to sync server");

                    match read_loop(&shared, &mut sink, &mut stream, &mut shutdown).await {
                        ReadEnd::Shutdown => return,
                        ReadEnd::Closed(reason) => {
                            warn!(reason = %reason, "connection lost");
                            if !shared.notify_if(gen, &StateChange::Error { reason }) {
                                return;
                            }
                        }
                    }
                } else if !shared.notify_if(
                    gen,
                    &StateChange::Error {
                        reason: "failed to send subscribe frame".to_string(),
                    },
                ) {
                    return;
                }
            }
            Err(e) => {
                warn!(err = %e, url = %url, "connect failed");
                if !shared.notify_if(
                    gen,
                    &StateChange::Error {
                        reason: e.to_string(),
                    },
                ) {
                    return;
                }
            }
        }

        attempt += 1;
        if policy.max_attempts > 0 && attempt > policy.max_attempts {
            warn!(attempts = attempt - 1, "reconnect ceiling reached — giving up");
            shared.transition_if(
                gen,
                ConnectionState::Failed,
                &StateChange::Failed {
                    attempts: attempt - 1,
                },
            );
            return;
        }

        let delay = reconnect_delay(&policy, attempt);
        if !shared.transition_if(
            gen,
            ConnectionState::Reconnecting,
            &StateChange::Reconnecting { attempt, delay },
        ) {
            return;
        }
        info!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");

        tokio::select! {
            _ = shutdown.recv() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Pump inbound frames until shutdown or channel loss. Dispatch happens
/// inline, so handlers for one frame finish before the next is parsed.
async fn read_loop(
    shared: &ClientShared,
    sink: &mut (impl SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    stream: &mut (impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
             + Unpin),
    shutdown: &mut broadcast::Receiver<()>,
) -> ReadEnd {
    loop {
        tokio::select! {
            _ = shutdown.recv() => return ReadEnd::Shutdown,

            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match Event::parse(&text) {
                            Ok(event) if event.is_heartbeat() => {
                                trace!("heartbeat");
                            }
                            Ok(event) => {
                                shared.registry.dispatch(&event);
                            }
                            Err(e) => {
                                warn!(err = %e, "dropping malformed frame");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return ReadEnd::Closed("channel closed by server".to_string());
                    }
                    Some(Err(e)) => return ReadEnd::Closed(e.to_string()),
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_linear_and_capped() {
        let policy = ReconnectConfig::default();
        let expected: Vec<u64> = vec![
            3000, 6000, 9000, 12000, 15000, 18000, 21000, 24000, 27000, 30000, 30000,
        ];
        for (i, want) in expected.iter().enumerate() {
            let attempt = (i + 1) as u32;
            assert_eq!(
                reconnect_delay(&policy, attempt),
                Duration::from_millis(*want),
                "attempt {attempt}"
            );
        }
    }

    #[tokio::test]
    async fn connect_invalid_from_connected_states() {
        let registry = Arc::new(HandlerRegistry::new());
        let client = TransportClient::new(
            "ws://127.0.0.1:1",
            &["tasks".to_string()],
            ReconnectConfig::default(),
            registry,
        );
        // Force an intermediate state without opening a socket.
        client.shared.set_state(ConnectionState::Connected);
        assert!(client.connect().is_err());

        client.shared.set_state(ConnectionState::Reconnecting);
        assert!(client.connect().is_err());

        client.shared.set_state(ConnectionState::Failed);
        // Valid again from Failed — it will immediately fail to dial, which
        // is fine; we only assert the transition is accepted.
        assert!(client.connect().is_ok());
        client.disconnect();
    }

    #[tokio::test]
    async fn disconnect_always_lands_disconnected() {
        // A dead port makes every dial fail fast, so the loop is busy
        // transitioning right when disconnect() lands. Whatever the
        // interleaving, the final state must be Disconnected and stay there.
        let registry = Arc::new(HandlerRegistry::new());
        let policy = ReconnectConfig {
            base_ms: 1,
            cap_ms: 5,
            max_attempts: 0,
        };
        let client =
            TransportClient::new("ws://127.0.0.1:1", &["tasks".to_string()], policy, registry);

        for i in 0..50u32 {
            client.connect().unwrap();
            // Vary the interleaving between the dial result and disconnect().
            for _ in 0..(i % 7) {
                tokio::task::yield_now().await;
            }
            client.disconnect();
            tokio::time::sleep(Duration::from_millis(5)).await;
            assert_eq!(
                client.state(),
                ConnectionState::Disconnected,
                "iteration {i}"
            );
        }
    }

    #[test]
    fn disconnect_is_idempotent() {
        let registry = Arc::new(HandlerRegistry::new());
        let client = TransportClient::new(
            "ws://127.0.0.1:1",
            &["tasks".to_string()],
            ReconnectConfig::default(),
            registry,
        );
        client.disconnect();
        client.disconnect();
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }
}
