//! Streaming channel server.
//!
//! One long-lived WebSocket per client. A connection declares its scopes in
//! a `subscribe` frame, then receives every matching published event. The
//! server emits periodic heartbeat frames to detect half-open connections
//! (proxies/NAT silently dropping idle sockets) and closes the channel when
//! nothing has moved within the idle timeout — the client treats that close
//! as an ordinary disconnect and reconnects.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::time::{interval, sleep_until, Instant};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::broadcast::Subscription;
use crate::events::Event;
use crate::AppContext;

/// First frame every client must send: `{"type":"subscribe","scopes":[...]}`.
#[derive(Deserialize)]
struct SubscribeFrame {
    #[serde(rename = "type")]
    frame_type: String,
    #[serde(default)]
    scopes: Vec<String>,
}

// ─── Server ──────────────────────────────────────────────────────────────────

pub async fn run(ctx: Arc<AppContext>) -> Result<()> {
    let addr = format!("{}:{}", ctx.config.bind_address, ctx.config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "sync server listening (WebSocket + HTTP health on same port)");

    // Graceful shutdown: resolve on SIGTERM (Unix) or Ctrl-C (all platforms).
    // Pinned so we can use it in the select! loop without moving.
    let shutdown = make_shutdown_future();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("shutdown signal received — stopping sync server");
                break;
            }

            conn = listener.accept() => {
                let (stream, peer) = match conn {
                    Ok(c) => c,
                    Err(e) => {
                        error!(err = %e, "accept error");
                        continue;
                    }
                };
                debug!(peer = %peer, "new connection");
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, ctx).await {
                        warn!(peer = %peer, err = %e, "connection error");
                    }
                });
            }
        }
    }

    info!("sync server stopped");
    Ok(())
}

/// Respond to an HTTP `GET /health` request with a JSON status document.
///
/// The server shares one port for both WebSocket and a plain HTTP health
/// endpoint so collaborators can check liveness without a WS library.
async fn handle_health_check(mut stream: tokio::net::TcpStream, ctx: &AppContext) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    // Consume the request (we don't inspect it — any GET /health is fine).
    let mut req_buf = vec![0u8; 2048];
    let _ = stream.read(&mut req_buf).await;

    let uptime_secs = ctx.started_at.elapsed().as_secs();
    let body = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": uptime_secs,
        "subscribers": ctx.broadcaster.subscriber_count(),
        "port": ctx.config.port,
    });
    let body_str = body.to_string();
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body_str.len(),
        body_str
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

/// Returns a future that resolves when a shutdown signal is received.
///
/// On Unix we listen for SIGTERM *and* Ctrl-C.
/// On other platforms we listen for Ctrl-C only.
async fn make_shutdown_future() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

async fn handle_connection(stream: tokio::net::TcpStream, ctx: Arc<AppContext>) -> Result<()> {
    // Peek at the first bytes to distinguish HTTP health checks from
    // WebSocket upgrades — both share the same port. A WS upgrade is also a
    // GET, so we match the /health path specifically; everything else falls
    // through to the WS handshake.
    let mut peek_buf = [0u8; 12];
    let n = stream.peek(&mut peek_buf).await.unwrap_or(0);
    if n >= 11 && &peek_buf[..11] == b"GET /health" {
        return handle_health_check(stream, &ctx).await;
    }

    let ws = accept_async(stream).await?;
    let (mut sink, mut stream) = ws.split();

    // ── Subscribe handshake ──────────────────────────────────────────────────
    // The first frame must declare the connection's scopes. A connection
    // that sends nothing within the handshake timeout, or declares no
    // scopes, is closed.
    let handshake = Duration::from_secs(ctx.config.sync.handshake_timeout_secs);
    let first = tokio::time::timeout(handshake, stream.next()).await;

    let text = match first {
        Ok(Some(Ok(Message::Text(t)))) => t,
        // Timeout, connection closed, or non-text frame — reject silently.
        _ => return Ok(()),
    };

    let frame: SubscribeFrame = match serde_json::from_str(&text) {
        Ok(f) => f,
        Err(e) => {
            warn!(err = %e, "unparseable subscribe frame — closing");
            return Ok(());
        }
    };
    if frame.frame_type != "subscribe" {
        warn!(frame_type = %frame.frame_type, "expected subscribe frame — closing");
        return Ok(());
    }

    let subscription = match ctx.broadcaster.register(&frame.scopes) {
        Ok(s) => s,
        Err(e) => {
            warn!(err = %e, "subscription rejected — closing");
            return Ok(());
        }
    };
    let sub_id = subscription.id();
    info!(subscriber = %sub_id, scopes = ?frame.scopes, "channel open");

    let result = channel_loop(&mut sink, &mut stream, &subscription, &ctx).await;

    ctx.broadcaster.unregister(sub_id);
    info!(subscriber = %sub_id, "channel closed");
    result
}

/// Pump events from the subscription queue to the socket, interleaved with
/// heartbeats, until the peer goes away or the channel idles out.
async fn channel_loop(
    sink: &mut (impl SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    stream: &mut (impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
             + Unpin),
    subscription: &Subscription,
    ctx: &AppContext,
) -> Result<()> {
    let heartbeat_period = Duration::from_secs(ctx.config.sync.heartbeat_secs);
    let idle_timeout = Duration::from_secs(ctx.config.sync.idle_timeout_secs);

    let mut heartbeat = interval(heartbeat_period);
    let mut last_traffic = Instant::now();

    loop {
        let idle_deadline = last_traffic + idle_timeout;

        tokio::select! {
            // Outgoing event from the broadcaster. A half-open peer that
            // stopped reading blocks the send once its TCP buffer fills, so
            // the send itself is bounded by the idle timeout — otherwise the
            // idle branch below would never be polled again.
            event = subscription.recv() => {
                match tokio::time::timeout(idle_timeout, sink.send(Message::Text(event.to_frame()))).await {
                    Ok(result) => {
                        result?;
                        last_traffic = Instant::now();
                    }
                    Err(_) => {
                        warn!(subscriber = %subscription.id(), "send stalled past idle timeout — closing");
                        break;
                    }
                }
            }

            // Periodic heartbeat so the peer can detect a half-open socket
            _ = heartbeat.tick() => {
                match tokio::time::timeout(idle_timeout, sink.send(Message::Text(Event::heartbeat().to_frame()))).await {
                    Ok(result) => {
                        result?;
                        last_traffic = Instant::now();
                    }
                    Err(_) => {
                        warn!(subscriber = %subscription.id(), "heartbeat stalled past idle timeout — closing");
                        break;
                    }
                }
            }

            // No traffic in either direction within the idle window
            _ = sleep_until(idle_deadline) => {
                warn!(subscriber = %subscription.id(), "channel idle timeout — closing");
                let _ = sink.send(Message::Close(None)).await;
                break;
            }

            // Incoming frame from the client
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        match tokio::time::timeout(idle_timeout, sink.send(Message::Pong(data))).await {
                            Ok(result) => {
                                result?;
                                last_traffic = Instant::now();
                            }
                            Err(_) => break,
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(err = %e, "ws error");
                        break;
                    }
                    // The channel is unidirectional — ignore other frames.
                    _ => {}
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_frame_parses_scopes() {
        let frame: SubscribeFrame =
            serde_json::from_str(r#"{"type":"subscribe","scopes":["tasks","conversations"]}"#)
                .unwrap();
        assert_eq!(frame.frame_type, "subscribe");
        assert_eq!(frame.scopes, vec!["tasks", "conversations"]);
    }

    #[test]
    fn subscribe_frame_scopes_default_empty() {
        let frame: SubscribeFrame = serde_json::from_str(r#"{"type":"subscribe"}"#).unwrap();
        assert!(frame.scopes.is_empty());
    }
}
