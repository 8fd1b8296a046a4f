//! End-to-end integration tests using a real WebSocket client.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use docket_realtime::{
    DevValidator, MemoryCoordinationStore, MemoryNotificationStore, NotificationStore,
    RealtimeConfig, RealtimeService,
};
use docket_server::config::ServerConfig;
use docket_server::server::DocketServer;
use tokio_util::sync::CancellationToken;

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

struct TestHarness {
    base_url: String,
    ws_url: String,
    service: Arc<RealtimeService>,
    notifications: Arc<MemoryNotificationStore>,
    cancel: CancellationToken,
}

/// Boot a test server on an auto-assigned port.
async fn boot_server() -> TestHarness {
    let notifications = Arc::new(MemoryNotificationStore::new());
    let service = RealtimeService::new(
        RealtimeConfig {
            per_client_cap: 2,
            ..RealtimeConfig::default()
        },
        Arc::new(MemoryCoordinationStore::default()),
        notifications.clone(),
        Arc::new(DevValidator),
    );

    let cancel = CancellationToken::new();
    let _background = service.spawn_background(&cancel);

    let server = DocketServer::new(ServerConfig::default(), service.clone(), None);
    let (addr, _serve) = server.listen().await.unwrap();

    TestHarness {
        base_url: format!("http://{addr}"),
        ws_url: format!("ws://{addr}/ws"),
        service,
        notifications,
        cancel,
    }
}

async fn connect(harness: &TestHarness, token: &str) -> WsStream {
    let (ws, _) = connect_async(format!("{}?token={token}", harness.ws_url))
        .await
        .expect("websocket connects");
    ws
}

/// Read frames until one with the given `type` arrives.
async fn expect_frame(ws: &mut WsStream, frame_type: &str) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("frame before timeout")
            .expect("stream open")
            .expect("frame ok");
        match msg {
            Message::Text(text) => {
                let v: Value = serde_json::from_str(&text).unwrap();
                if v["type"] == frame_type {
                    return v;
                }
            }
            Message::Ping(payload) => {
                let _ = ws.send(Message::Pong(payload)).await;
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn connect_receives_connected_frame() {
    let harness = boot_server().await;
    let mut ws = connect(&harness, "client_42").await;

    let frame = expect_frame(&mut ws, "connected").await;
    assert_eq!(frame["data"]["clientId"], "client_42");
    assert!(frame["data"]["connectionId"].is_string());

    harness.cancel.cancel();
}

#[tokio::test]
async fn invalid_token_is_rejected_before_upgrade() {
    let harness = boot_server().await;
    let result = connect_async(format!("{}?token=", harness.ws_url)).await;
    assert!(result.is_err(), "empty token must not upgrade");
    harness.cancel.cancel();
}

#[tokio::test]
async fn ping_pong_roundtrip() {
    let harness = boot_server().await;
    let mut ws = connect(&harness, "client_42").await;
    let _ = expect_frame(&mut ws, "connected").await;

    ws.send(Message::Text(r#"{"type":"ping"}"#.into()))
        .await
        .unwrap();
    let _ = expect_frame(&mut ws, "pong").await;

    harness.cancel.cancel();
}

#[tokio::test]
async fn notify_reaches_connected_client() {
    let harness = boot_server().await;
    let mut ws = connect(&harness, "client_42").await;
    let _ = expect_frame(&mut ws, "connected").await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/notify", harness.base_url))
        .json(&json!({
            "clientId": "client_42",
            "payload": {"kind": "invoice.created", "invoiceId": "inv_9"},
            "priority": "high",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);
    let body: Value = resp.json().await.unwrap();
    let update_id = body["updateId"].as_str().unwrap().to_owned();

    let frame = expect_frame(&mut ws, "update").await;
    assert_eq!(frame["data"]["updateId"], update_id.as_str());
    assert_eq!(frame["data"]["payload"]["invoiceId"], "inv_9");
    assert_eq!(frame["data"]["priority"], "high");

    harness.cancel.cancel();
}

#[tokio::test]
async fn group_subscription_fan_out() {
    let harness = boot_server().await;
    let mut ws_a = connect(&harness, "client_a").await;
    let mut ws_b = connect(&harness, "client_b").await;
    let _ = expect_frame(&mut ws_a, "connected").await;
    let _ = expect_frame(&mut ws_b, "connected").await;

    // Only client A joins the case group.
    ws_a.send(Message::Text(
        r#"{"type":"subscribe","data":{"group":"case:7"}}"#.into(),
    ))
    .await
    .unwrap();

    // Subscribing is applied asynchronously to the receive loop; give it a
    // beat before the group notify.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/notify", harness.base_url))
        .json(&json!({
            "group": "case:7",
            "payload": {"kind": "filing.accepted"},
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);

    let frame = expect_frame(&mut ws_a, "update").await;
    assert_eq!(frame["data"]["payload"]["kind"], "filing.accepted");

    // Client B must not receive the group update.
    let nothing = timeout(Duration::from_millis(300), ws_b.next()).await;
    assert!(nothing.is_err(), "unsubscribed client received group update");

    harness.cancel.cancel();
}

#[tokio::test]
async fn ack_marks_notification_delivered() {
    let harness = boot_server().await;
    let mut ws = connect(&harness, "client_42").await;
    let _ = expect_frame(&mut ws, "connected").await;

    let client = reqwest::Client::new();
    let _ = client
        .post(format!("{}/notify", harness.base_url))
        .json(&json!({
            "clientId": "client_42",
            "payload": {"kind": "message.received"},
        }))
        .send()
        .await
        .unwrap();

    let frame = expect_frame(&mut ws, "update").await;
    let update_id = frame["data"]["updateId"].as_str().unwrap();
    let notification_id = frame["data"]["notificationId"].as_str().unwrap();

    ws.send(Message::Text(
        format!(r#"{{"type":"ack","data":{{"updateId":"{update_id}"}}}}"#).into(),
    ))
    .await
    .unwrap();

    // The ack is reconciled asynchronously; poll the store.
    let id = docket_core::NotificationId::from(notification_id);
    let mut delivered = false;
    for _ in 0..50 {
        if harness.notifications.status(&id)
            == Some(docket_realtime::NotificationStatus::Delivered)
        {
            delivered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(delivered, "ack should mark the notification delivered");

    harness.cancel.cancel();
}

#[tokio::test]
async fn reconnect_replays_undelivered() {
    let harness = boot_server().await;

    // Notifications created while the client is offline.
    let _ = harness
        .notifications
        .create_pending(&docket_core::ClientId::from("client_42"), &json!({"n": 1}))
        .await
        .unwrap();
    let _ = harness
        .notifications
        .create_pending(&docket_core::ClientId::from("client_42"), &json!({"n": 2}))
        .await
        .unwrap();

    let mut ws = connect(&harness, "client_42").await;
    let _ = expect_frame(&mut ws, "connected").await;

    let first = expect_frame(&mut ws, "update").await;
    assert_eq!(first["data"]["payload"]["n"], 1);
    let second = expect_frame(&mut ws, "update").await;
    assert_eq!(second["data"]["payload"]["n"], 2);

    harness.cancel.cancel();
}

#[tokio::test]
async fn per_client_cap_closes_oldest_connection() {
    let harness = boot_server().await;

    // Cap is 2 in the test config; the third connection evicts the first.
    let mut ws1 = connect(&harness, "client_42").await;
    let _ = expect_frame(&mut ws1, "connected").await;
    let mut ws2 = connect(&harness, "client_42").await;
    let _ = expect_frame(&mut ws2, "connected").await;
    let mut ws3 = connect(&harness, "client_42").await;
    let _ = expect_frame(&mut ws3, "connected").await;

    // The first socket is drained and closed by the server.
    let mut closed = false;
    for _ in 0..50 {
        match timeout(Duration::from_millis(100), ws1.next()).await {
            Ok(None) | Ok(Some(Err(_))) => {
                closed = true;
                break;
            }
            Ok(Some(Ok(Message::Close(_)))) => {
                closed = true;
                break;
            }
            _ => {}
        }
    }
    assert!(closed, "oldest connection should be closed after eviction");

    let stats = harness.service.stats();
    assert_eq!(stats.registry.total_connections, 2);

    harness.cancel.cancel();
}

#[tokio::test]
async fn invalid_frame_gets_error_and_connection_survives() {
    let harness = boot_server().await;
    let mut ws = connect(&harness, "client_42").await;
    let _ = expect_frame(&mut ws, "connected").await;

    ws.send(Message::Text("this is not json".into()))
        .await
        .unwrap();
    let error = expect_frame(&mut ws, "error").await;
    assert_eq!(error["data"]["code"], "INVALID_FRAME");

    // Still usable afterwards.
    ws.send(Message::Text(r#"{"type":"ping"}"#.into()))
        .await
        .unwrap();
    let _ = expect_frame(&mut ws, "pong").await;

    harness.cancel.cancel();
}

#[tokio::test]
async fn health_and_stats_reflect_connections() {
    let harness = boot_server().await;
    let mut ws = connect(&harness, "client_42").await;
    let _ = expect_frame(&mut ws, "connected").await;

    let client = reqwest::Client::new();
    let health: Value = client
        .get(format!("{}/health", harness.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["connections"], 1);

    let stats: Value = client
        .get(format!("{}/stats", harness.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["registry"]["totalConnections"], 1);
    assert_eq!(stats["registry"]["uniqueClients"], 1);

    harness.cancel.cancel();
}

#[tokio::test]
async fn notify_for_absent_client_is_accepted_and_replayed_later() {
    let harness = boot_server().await;

    // Nobody connected for this client yet.
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/notify", harness.base_url))
        .json(&json!({
            "clientId": "client_away",
            "payload": {"kind": "appointment.reminder"},
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);

    // The update was still published cross-instance (no local targets).
    let mut published = false;
    for _ in 0..50 {
        if harness.service.stats().coordinator_publishes >= 1 {
            published = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(published, "empty local resolution must still publish");

    // A later connection replays the missed update.
    let mut ws = connect(&harness, "client_away").await;
    let _ = expect_frame(&mut ws, "connected").await;
    let frame = expect_frame(&mut ws, "update").await;
    assert_eq!(frame["data"]["payload"]["kind"], "appointment.reminder");

    harness.cancel.cancel();
}
