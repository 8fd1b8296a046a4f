//! WebSocket session lifecycle — handles a single connected client from
//! upgrade through disconnect.
//!
//! The token is validated before the upgrade completes; invalid tokens
//! never reach the registry. After admission the client gets a `connected`
//! frame followed by a replay of its undelivered notifications, then the
//! session settles into the outbound forwarder + inbound loop pair. The
//! connection's cancellation token (cut by eviction, keepalive timeout, or
//! shutdown) ends both loops.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use metrics::histogram;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use docket_core::ServerFrame;
use docket_realtime::{
    ClientConnection, ConnectionMeta, Identity, OutboundMessage, RemoveReason,
};

use crate::server::AppState;
use super::handler::handle_frame;

/// Query parameters on the `/ws` upgrade request.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Bearer token, validated once at admission.
    token: String,
}

/// GET /ws — authenticate, then upgrade.
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let identity = match state.service.validator().validate(&query.token).await {
        Ok(identity) => identity,
        Err(err) => {
            debug!(%err, "rejected connection attempt");
            return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
        }
    };

    let meta = ConnectionMeta {
        remote_addr: Some(remote_addr.to_string()),
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(ToOwned::to_owned),
    };

    let max_message_size = state.config.max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| run_ws_session(socket, identity, meta, state))
}

/// Run a WebSocket session for an authenticated client.
///
/// 1. Admits the connection (evicting the client's oldest if over cap)
/// 2. Announces presence and sends the `connected` frame
/// 3. Replays undelivered notifications
/// 4. Forwards outbound frames/probes and dispatches inbound frames
/// 5. Cleans up deterministically on disconnect or cancellation
#[instrument(skip_all, fields(client_id = %identity.client_id))]
pub async fn run_ws_session(
    ws: WebSocket,
    identity: Identity,
    meta: ConnectionMeta,
    state: AppState,
) {
    let service = state.service.clone();
    let (mut ws_tx, mut ws_rx) = ws.split();

    let (send_tx, mut send_rx) =
        mpsc::channel::<OutboundMessage>(service.config().outbound_buffer);
    let conn = Arc::new(ClientConnection::new(
        identity.client_id.clone(),
        identity.session_id,
        send_tx,
        meta,
    ));
    let _ = conn.mark_connected();

    let session_start = Instant::now();
    let outcome = service.registry().admit(conn.clone());
    if let Some(evicted) = &outcome.evicted {
        debug!(evicted = %evicted, "evicted oldest connection for this client");
    }

    // Best-effort: a down coordination store degrades, never rejects.
    let _ = service
        .coordinator()
        .announce_presence(&conn.client_id, &conn.id)
        .await;

    let greeting = ServerFrame::Connected {
        client_id: conn.client_id.clone(),
        connection_id: conn.id.clone(),
    };
    let _ = conn.try_send(&greeting);

    let replayed = service.replay_undelivered(&conn).await;
    if replayed > 0 {
        info!(replayed, "caught client up on undelivered notifications");
    }

    // Outbound forwarder: the only task writing to the socket.
    let forwarder_cancel = conn.cancel_token();
    let forwarder = tokio::spawn(async move {
        loop {
            tokio::select! {
                () = forwarder_cancel.cancelled() => break,
                msg = send_rx.recv() => match msg {
                    Some(OutboundMessage::Frame(json)) => {
                        if ws_tx
                            .send(Message::Text(json.as_str().to_owned().into()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(OutboundMessage::Probe) => {
                        if ws_tx.send(Message::Ping(vec![].into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
        // Confirm the close handshake where the transport still allows it.
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    // Inbound loop.
    let cancel = conn.cancel_token();
    loop {
        let msg = tokio::select! {
            () = cancel.cancelled() => break,
            msg = ws_rx.next() => msg,
        };

        let Some(Ok(msg)) = msg else {
            // Closed stream or transport error: abrupt terminal condition.
            break;
        };

        let text = match msg {
            Message::Text(ref t) => {
                conn.mark_active();
                Some(t.to_string())
            }
            Message::Binary(ref data) => {
                conn.mark_active();
                match std::str::from_utf8(data) {
                    Ok(s) => Some(s.to_owned()),
                    Err(_) => {
                        debug!(len = data.len(), "ignoring non-UTF8 binary frame");
                        None
                    }
                }
            }
            Message::Close(_) => {
                info!("client sent close frame");
                break;
            }
            Message::Pong(_) => {
                // The probe response: refresh liveness and presence.
                conn.mark_active();
                let _ = service
                    .coordinator()
                    .announce_presence(&conn.client_id, &conn.id)
                    .await;
                None
            }
            Message::Ping(_) => {
                conn.mark_active();
                None
            }
        };

        let Some(text) = text else { continue };

        if let Some(response) = handle_frame(&text, &conn, &service).await {
            if !conn.try_send(&response) {
                debug!("failed to enqueue response (channel full or closed)");
            }
        }
    }

    // Clean up. Remove is idempotent — eviction may already have run it.
    let _ = service.registry().remove(&conn.id, RemoveReason::Disconnect);
    let _ = conn.close();
    if let Err(err) = service
        .coordinator()
        .revoke_presence(&conn.client_id, &conn.id)
        .await
    {
        debug!(%err, "presence revoke failed (degraded store)");
    }
    histogram!("ws_connection_duration_seconds").record(session_start.elapsed().as_secs_f64());
    info!(connection_id = %conn.id, "session ended");

    if tokio::time::timeout(std::time::Duration::from_secs(5), forwarder)
        .await
        .is_err()
    {
        warn!("outbound forwarder did not stop in time");
    }
}
