//! Connection-level wire frames.
//!
//! Minimal JSON framing, adjacently tagged as `{"type": ..., "data": ...}`.
//! The payload inside an `update` frame is opaque to this layer.

use serde::{Deserialize, Serialize};

use crate::ids::{ClientId, ConnectionId, GroupName, UpdateId};
use crate::update::Update;

/// Frames a client may send.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
#[serde(rename_all_fields = "camelCase")]
pub enum ClientFrame {
    /// Application-level liveness probe; answered with `pong`.
    Ping,
    /// Join a subscription group.
    Subscribe {
        /// Group to join.
        group: GroupName,
    },
    /// Leave a subscription group.
    Unsubscribe {
        /// Group to leave.
        group: GroupName,
    },
    /// Confirm receipt of an update.
    Ack {
        /// The update being acknowledged.
        update_id: UpdateId,
        /// Whether the client also displayed it (delivered vs read).
        #[serde(default)]
        read: bool,
    },
}

/// Frames the server may send.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
#[serde(rename_all_fields = "camelCase")]
pub enum ServerFrame {
    /// Answer to a client `ping`.
    Pong,
    /// Admission handshake, sent once right after the upgrade.
    Connected {
        /// The authenticated client.
        client_id: ClientId,
        /// The connection's own ID (used in server logs and support).
        connection_id: ConnectionId,
    },
    /// A realtime update.
    Update(Update),
    /// A protocol-level error; the connection stays open.
    Error {
        /// Machine-readable code.
        code: String,
        /// Human-readable message.
        message: String,
    },
}

impl ServerFrame {
    /// Build an error frame.
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Serialize to the wire string. Serialization of these frames cannot
    /// fail in practice; a failure is reported as an error frame string.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"error","data":{"code":"INTERNAL","message":"serialization failed"}}"#
                .to_owned()
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::{UpdatePriority, UpdateTarget};
    use serde_json::json;

    #[test]
    fn ping_frame_parses_without_data() {
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(frame, ClientFrame::Ping);
    }

    #[test]
    fn subscribe_frame_parses() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"subscribe","data":{"group":"case:1042"}}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Subscribe {
                group: GroupName::from("case:1042")
            }
        );
    }

    #[test]
    fn unsubscribe_frame_parses() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"unsubscribe","data":{"group":"case:1042"}}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Unsubscribe {
                group: GroupName::from("case:1042")
            }
        );
    }

    #[test]
    fn ack_frame_defaults_read_to_false() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"ack","data":{"updateId":"u1"}}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Ack {
                update_id: UpdateId::from("u1"),
                read: false
            }
        );
    }

    #[test]
    fn ack_frame_with_read() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"ack","data":{"updateId":"u1","read":true}}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Ack {
                update_id: UpdateId::from("u1"),
                read: true
            }
        );
    }

    #[test]
    fn unknown_frame_type_is_an_error() {
        let result: Result<ClientFrame, _> = serde_json::from_str(r#"{"type":"shout"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn pong_serializes_without_data() {
        let json = ServerFrame::Pong.to_json();
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["type"], "pong");
        assert!(v.get("data").is_none());
    }

    #[test]
    fn connected_frame_shape() {
        let frame = ServerFrame::Connected {
            client_id: ClientId::from("42"),
            connection_id: ConnectionId::from("conn_1"),
        };
        let v: serde_json::Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(v["type"], "connected");
        assert_eq!(v["data"]["clientId"], "42");
        assert_eq!(v["data"]["connectionId"], "conn_1");
    }

    #[test]
    fn update_frame_carries_update_fields() {
        let update = Update::new(
            UpdateTarget::Client(ClientId::from("42")),
            json!({"kind": "message.received"}),
            UpdatePriority::High,
        );
        let frame = ServerFrame::Update(update.clone());
        let v: serde_json::Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(v["type"], "update");
        assert_eq!(v["data"]["updateId"], update.id.as_str());
        assert_eq!(v["data"]["payload"]["kind"], "message.received");
        assert_eq!(v["data"]["priority"], "high");
    }

    #[test]
    fn error_frame_shape() {
        let frame = ServerFrame::error("UNKNOWN_CONNECTION", "gone");
        let v: serde_json::Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(v["type"], "error");
        assert_eq!(v["data"]["code"], "UNKNOWN_CONNECTION");
        assert_eq!(v["data"]["message"], "gone");
    }

    #[test]
    fn client_frame_roundtrip() {
        let frames = [
            ClientFrame::Ping,
            ClientFrame::Subscribe {
                group: GroupName::from("g"),
            },
            ClientFrame::Ack {
                update_id: UpdateId::from("u"),
                read: true,
            },
        ];
        for frame in frames {
            let json = serde_json::to_string(&frame).unwrap();
            let back: ClientFrame = serde_json::from_str(&json).unwrap();
            assert_eq!(back, frame);
        }
    }
}
