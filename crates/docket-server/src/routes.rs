//! HTTP routes other services call: `POST /notify` and `GET /stats`.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use docket_core::{ClientId, GroupName, UpdatePriority, UpdateTarget};
use docket_realtime::ServiceStats;

use crate::server::AppState;

/// Body of `POST /notify` — the sole inbound entry point sibling services
/// (billing, messaging, case status) use to push a realtime update.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyRequest {
    /// Target client (at least one of `clientId`/`group` required).
    pub client_id: Option<ClientId>,
    /// Target group.
    pub group: Option<GroupName>,
    /// Opaque payload forwarded verbatim.
    pub payload: Value,
    /// Delivery priority (defaults to `normal`).
    #[serde(default)]
    pub priority: UpdatePriority,
    /// Optional expiry.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Body of a successful `POST /notify`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyResponse {
    /// The enqueued update.
    pub update_id: String,
}

/// POST /notify
pub async fn notify_handler(
    State(state): State<AppState>,
    Json(request): Json<NotifyRequest>,
) -> Response {
    let Ok(target) = UpdateTarget::from_parts(request.client_id, request.group) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": "update target must name a client id, a group, or both",
            })),
        )
            .into_response();
    };

    let update_id = state
        .service
        .notify(target, request.payload, request.priority, request.expires_at)
        .await;

    (
        StatusCode::ACCEPTED,
        Json(NotifyResponse {
            update_id: update_id.into_inner(),
        }),
    )
        .into_response()
}

/// GET /stats
pub async fn stats_handler(State(state): State<AppState>) -> Json<ServiceStats> {
    Json(state.service.stats())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_request_parses_with_defaults() {
        let body = r#"{"clientId": "42", "payload": {"kind": "invoice.created"}}"#;
        let request: NotifyRequest = serde_json::from_str(body).unwrap();
        assert_eq!(request.client_id.as_ref().unwrap().as_str(), "42");
        assert!(request.group.is_none());
        assert_eq!(request.priority, UpdatePriority::Normal);
        assert!(request.expires_at.is_none());
    }

    #[test]
    fn notify_request_full() {
        let body = r#"{
            "group": "case:7",
            "payload": {"kind": "filing.accepted"},
            "priority": "urgent",
            "expiresAt": "2026-08-06T12:00:00Z"
        }"#;
        let request: NotifyRequest = serde_json::from_str(body).unwrap();
        assert_eq!(request.group.as_ref().unwrap().as_str(), "case:7");
        assert_eq!(request.priority, UpdatePriority::Urgent);
        assert!(request.expires_at.is_some());
    }

    #[test]
    fn notify_response_wire_shape() {
        let response = NotifyResponse {
            update_id: "u1".into(),
        };
        let v = serde_json::to_value(&response).unwrap();
        assert_eq!(v["updateId"], "u1");
    }
}
