//! Inbound frame dispatch — parses client text frames and routes them to
//! the realtime service.

use std::sync::Arc;

use tracing::debug;

use docket_core::{ClientFrame, RealtimeError, ServerFrame};
use docket_realtime::{ClientConnection, RealtimeService};

/// Handle one inbound text frame. Returns the frame to send back, if any.
///
/// Unparseable input gets an `error` frame and the connection stays open.
pub async fn handle_frame(
    text: &str,
    conn: &Arc<ClientConnection>,
    service: &Arc<RealtimeService>,
) -> Option<ServerFrame> {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            debug!(connection_id = %conn.id, %err, "unparseable frame");
            return Some(ServerFrame::error("INVALID_FRAME", format!("invalid frame: {err}")));
        }
    };

    match frame {
        ClientFrame::Ping => Some(ServerFrame::Pong),
        ClientFrame::Subscribe { group } => {
            match service.registry().subscribe(&conn.id, group.clone()) {
                Ok(_) => {
                    debug!(connection_id = %conn.id, group = %group, "subscribed");
                    None
                }
                Err(err @ RealtimeError::UnknownConnection(_)) => {
                    // Benign race with a concurrent disconnect.
                    debug!(connection_id = %conn.id, %err, "subscribe on gone connection");
                    None
                }
                Err(err) => Some(ServerFrame::error(err.code(), err.to_string())),
            }
        }
        ClientFrame::Unsubscribe { group } => {
            match service.registry().unsubscribe(&conn.id, &group) {
                Ok(_) => {
                    debug!(connection_id = %conn.id, group = %group, "unsubscribed");
                    None
                }
                Err(err @ RealtimeError::UnknownConnection(_)) => {
                    debug!(connection_id = %conn.id, %err, "unsubscribe on gone connection");
                    None
                }
                Err(err) => Some(ServerFrame::error(err.code(), err.to_string())),
            }
        }
        ClientFrame::Ack { update_id, read } => {
            service.acknowledge(&conn.id, &update_id, read).await;
            None
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
