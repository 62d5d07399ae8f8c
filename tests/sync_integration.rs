//! End-to-end tests over a real WebSocket server on a random port.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

use boardd::client::registry::HandlerRegistry;
use boardd::client::{ConnectionState, StateChange, TransportClient};
use boardd::config::{DaemonConfig, ReconnectConfig, SyncConfig};
use boardd::domain::{ResponseSummary, Task, TaskStatus};
use boardd::events::{scopes, types, Event};
use boardd::{server, AppContext};

/// Find a free local port by binding to port 0.
fn get_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn make_task(id: &str) -> Task {
    Task {
        id: id.to_string(),
        title: format!("Task {id}"),
        description: String::new(),
        status: TaskStatus::Pending,
        assignee_id: None,
        creator_id: "u1".to_string(),
        tag_id: "ops".to_string(),
        parent_id: None,
        summary: ResponseSummary::default(),
    }
}

/// Spin up a server on a random port and wait until it accepts connections.
async fn start_test_server(sync: SyncConfig) -> (String, Arc<AppContext>) {
    let port = get_free_port();
    let config = DaemonConfig {
        port,
        bind_address: "127.0.0.1".to_string(),
        data_dir: std::env::temp_dir(),
        log: "error".to_string(),
        log_format: "pretty".to_string(),
        sync,
        reconnect: ReconnectConfig::default(),
    };
    let url = config.ws_url();
    let ctx = Arc::new(AppContext::new(config));
    tokio::spawn(server::run(ctx.clone()));

    // Wait until the listener is up.
    for _ in 0..50 {
        if tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .is_ok()
        {
            return (url, ctx);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("test server did not start on port {port}");
}

fn quiet_sync() -> SyncConfig {
    SyncConfig {
        heartbeat_secs: 60,
        idle_timeout_secs: 300,
        handshake_timeout_secs: 5,
        queue_capacity: 32,
    }
}

async fn subscribe(url: &str, scope_list: &[&str]) -> tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
> {
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    let frame = serde_json::json!({ "type": "subscribe", "scopes": scope_list }).to_string();
    ws.send(Message::Text(frame)).await.unwrap();
    ws
}

/// Read frames until a non-heartbeat event arrives.
async fn next_event(
    ws: &mut (impl StreamExt<
        Item = Result<Message, tokio_tungstenite::tungstenite::Error>,
    > + Unpin),
) -> Event {
    loop {
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for event")
            .expect("stream ended")
            .expect("ws error");
        if let Message::Text(text) = msg {
            let event = Event::parse(&text).unwrap();
            if !event.is_heartbeat() {
                return event;
            }
        }
    }
}

#[tokio::test]
async fn subscriber_receives_only_declared_scopes() {
    let (url, ctx) = start_test_server(quiet_sync()).await;
    let mut ws = subscribe(&url, &[scopes::TASKS]).await;

    // Registration is processed after the subscribe frame lands.
    for _ in 0..50 {
        if ctx.broadcaster.subscriber_count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(ctx.broadcaster.subscriber_count(), 1);

    // Out-of-scope event first, then a matching one. Only the matching
    // event may arrive.
    let message = boardd::domain::ConversationMessage::new("t1", "u2", "hello");
    ctx.broadcaster.publish(&Event::response_created(&message));
    ctx.broadcaster.publish(&Event::task_created(&make_task("t1")));

    let event = next_event(&mut ws).await;
    assert_eq!(event.event_type, types::TASK_CREATED);
    assert_eq!(event.data["id"], "t1");
}

#[tokio::test]
async fn events_arrive_in_publish_order() {
    let (url, ctx) = start_test_server(quiet_sync()).await;
    let mut ws = subscribe(&url, &[scopes::TASKS]).await;
    for _ in 0..50 {
        if ctx.broadcaster.subscriber_count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    for i in 0..5 {
        ctx.broadcaster
            .publish(&Event::task_created(&make_task(&format!("t{i}"))));
    }
    for i in 0..5 {
        let event = next_event(&mut ws).await;
        assert_eq!(event.data["id"], format!("t{i}"));
    }
}

#[tokio::test]
async fn heartbeat_frames_arrive() {
    let sync = SyncConfig {
        heartbeat_secs: 1,
        idle_timeout_secs: 300,
        handshake_timeout_secs: 5,
        queue_capacity: 32,
    };
    let (url, _ctx) = start_test_server(sync).await;
    let mut ws = subscribe(&url, &[scopes::SYSTEM]).await;

    let msg = timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("no heartbeat within 5s")
        .unwrap()
        .unwrap();
    let Message::Text(text) = msg else {
        panic!("expected text frame, got {msg:?}");
    };
    let event = Event::parse(&text).unwrap();
    assert!(event.is_heartbeat());
}

#[tokio::test]
async fn idle_channel_is_closed_by_server() {
    // Idle timeout shorter than the heartbeat period, so nothing resets the
    // idle clock after the initial heartbeat tick.
    let sync = SyncConfig {
        heartbeat_secs: 60,
        idle_timeout_secs: 1,
        handshake_timeout_secs: 5,
        queue_capacity: 32,
    };
    let (url, _ctx) = start_test_server(sync).await;
    let mut ws = subscribe(&url, &[scopes::TASKS]).await;

    // Skip the immediate first heartbeat, then expect a close.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let msg = tokio::time::timeout_at(deadline, ws.next())
            .await
            .expect("server did not close the idle channel");
        match msg {
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(_)) => break,
        }
    }
}

#[tokio::test]
async fn connection_without_subscribe_gets_no_events() {
    let (url, ctx) = start_test_server(quiet_sync()).await;
    let (_ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    // Never sends a subscribe frame; the server must not register it.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(ctx.broadcaster.subscriber_count(), 0);
}

#[tokio::test]
async fn client_connects_dispatches_and_disconnects() {
    let (url, ctx) = start_test_server(quiet_sync()).await;

    let registry = Arc::new(HandlerRegistry::new());
    let client = TransportClient::new(
        &url,
        &[scopes::TASKS.to_string()],
        ReconnectConfig::default(),
        registry,
    );

    let (state_tx, mut state_rx) = tokio::sync::mpsc::unbounded_channel();
    client.on_connection_state(move |change| {
        let _ = state_tx.send(change.clone());
    });
    let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel();
    client.on(types::TASK_CREATED, move |event| {
        let _ = event_tx.send(event.clone());
    });

    client.connect().unwrap();
    let change = timeout(Duration::from_secs(5), state_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(change, StateChange::Connected));
    assert_eq!(client.state(), ConnectionState::Connected);

    // Give the server time to process the subscribe frame.
    for _ in 0..50 {
        if ctx.broadcaster.subscriber_count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    ctx.broadcaster.publish(&Event::task_created(&make_task("t1")));
    let received = timeout(Duration::from_secs(5), event_rx.recv())
        .await
        .expect("handler was not invoked")
        .unwrap();
    assert_eq!(received.data["id"], "t1");

    client.disconnect();
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn client_reconnects_after_server_drops_the_channel() {
    // The server idles the channel out after 1s while the listener stays
    // up, so the client sees a close and must dial again.
    let sync = SyncConfig {
        heartbeat_secs: 60,
        idle_timeout_secs: 1,
        handshake_timeout_secs: 5,
        queue_capacity: 32,
    };
    let (url, _ctx) = start_test_server(sync).await;

    let policy = ReconnectConfig {
        base_ms: 100,
        cap_ms: 500,
        max_attempts: 0,
    };
    let registry = Arc::new(HandlerRegistry::new());
    let client = TransportClient::new(&url, &[scopes::TASKS.to_string()], policy, registry);

    let (state_tx, mut state_rx) = tokio::sync::mpsc::unbounded_channel();
    client.on_connection_state(move |change| {
        let _ = state_tx.send(change.clone());
    });

    client.connect().unwrap();

    // Connected → Error (server close) → Reconnecting → Connected again.
    let mut connected = 0;
    let mut reconnecting = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while connected < 2 {
        let change = tokio::time::timeout_at(deadline, state_rx.recv())
            .await
            .expect("client did not reconnect in time")
            .unwrap();
        match change {
            StateChange::Connected => connected += 1,
            StateChange::Reconnecting { .. } => reconnecting += 1,
            _ => {}
        }
    }
    assert!(reconnecting >= 1);
    assert_eq!(client.state(), ConnectionState::Connected);
    client.disconnect();
}

#[tokio::test]
async fn disconnect_cancels_pending_reconnect() {
    // Nothing listens on this port, so every dial fails and the client sits
    // in Reconnecting between attempts.
    let port = get_free_port();
    let url = format!("ws://127.0.0.1:{port}");

    let policy = ReconnectConfig {
        base_ms: 300,
        cap_ms: 1000,
        max_attempts: 0,
    };
    let registry = Arc::new(HandlerRegistry::new());
    let client = TransportClient::new(&url, &[scopes::TASKS.to_string()], policy, registry);

    let (state_tx, mut state_rx) = tokio::sync::mpsc::unbounded_channel();
    client.on_connection_state(move |change| {
        let _ = state_tx.send(change.clone());
    });

    client.connect().unwrap();

    // Wait until a reconnect is scheduled.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let change = tokio::time::timeout_at(deadline, state_rx.recv())
            .await
            .expect("never entered Reconnecting")
            .unwrap();
        if matches!(change, StateChange::Reconnecting { .. }) {
            break;
        }
    }

    client.disconnect();
    assert_eq!(client.state(), ConnectionState::Disconnected);

    // Drain whatever was already in flight, then verify no dial attempt
    // fires after the originally scheduled delay.
    while state_rx.try_recv().is_ok() {}
    tokio::time::sleep(Duration::from_millis(800)).await;
    while let Ok(change) = state_rx.try_recv() {
        assert!(
            matches!(change, StateChange::Disconnected),
            "activity after disconnect: {change:?}"
        );
    }
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn reconnect_ceiling_transitions_to_failed() {
    let port = get_free_port();
    let url = format!("ws://127.0.0.1:{port}");

    let policy = ReconnectConfig {
        base_ms: 50,
        cap_ms: 200,
        max_attempts: 2,
    };
    let registry = Arc::new(HandlerRegistry::new());
    let client = TransportClient::new(&url, &[scopes::TASKS.to_string()], policy, registry);

    let (state_tx, mut state_rx) = tokio::sync::mpsc::unbounded_channel();
    client.on_connection_state(move |change| {
        let _ = state_tx.send(change.clone());
    });

    client.connect().unwrap();

    let mut reconnecting = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let change = tokio::time::timeout_at(deadline, state_rx.recv())
            .await
            .expect("never reached Failed")
            .unwrap();
        match change {
            StateChange::Reconnecting { .. } => reconnecting += 1,
            StateChange::Failed { attempts } => {
                assert_eq!(attempts, 2);
                break;
            }
            _ => {}
        }
    }
    assert_eq!(reconnecting, 2);
    assert_eq!(client.state(), ConnectionState::Failed);

    // The loop has stopped: no further dial attempts or state changes.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(state_rx.try_recv().is_err());
    assert_eq!(client.state(), ConnectionState::Failed);

    // Failed is terminal only until connect() is called again.
    client.connect().unwrap();
    client.disconnect();
}

#[tokio::test]
async fn stalled_subscriber_is_dropped_after_idle_timeout() {
    let sync = SyncConfig {
        heartbeat_secs: 60,
        idle_timeout_secs: 1,
        handshake_timeout_secs: 5,
        queue_capacity: 64,
    };
    let (url, ctx) = start_test_server(sync).await;

    // Subscribe, then never read: the peer's receive buffer fills and the
    // server's sends stall mid-flood.
    let ws = subscribe(&url, &[scopes::TASKS]).await;
    for _ in 0..50 {
        if ctx.broadcaster.subscriber_count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(ctx.broadcaster.subscriber_count(), 1);

    // Enough outbound volume to overrun the socket buffers on loopback.
    let blob = "x".repeat(1 << 20);
    for _ in 0..64 {
        ctx.broadcaster.publish(&Event::new(
            types::TASK_UPDATED,
            serde_json::json!({ "blob": blob }),
            scopes::TASKS,
        ));
    }

    // The server must give up on the stalled channel and unregister it.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while ctx.broadcaster.subscriber_count() != 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "stalled subscriber was never dropped"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    drop(ws);
}

#[tokio::test]
async fn health_endpoint_reports_status() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let (url, _ctx) = start_test_server(quiet_sync()).await;
    let addr = url.trim_start_matches("ws://").to_string();

    let mut stream = tokio::net::TcpStream::connect(&addr).await.unwrap();
    let request = format!("GET /health HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    let body = response.split_once("\r\n\r\n").unwrap().1;
    let json: serde_json::Value = serde_json::from_str(body).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["subscribers"], 0);
}
