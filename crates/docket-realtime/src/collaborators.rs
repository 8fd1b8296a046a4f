//! Contracts for the external collaborators the realtime core consumes.
//!
//! Notification persistence and identity validation live outside this
//! subsystem; the core only sees these narrow traits. The in-memory
//! implementations back tests and single-node development deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use docket_core::{ClientId, NotificationId, SessionId};

/// A collaborator call failed.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    /// The collaborator service could not be reached.
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
}

/// Authentication failure at connection admission.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The presented token did not validate.
    #[error("invalid token")]
    InvalidToken,
    /// The validator service could not be reached.
    #[error("validator unavailable: {0}")]
    Unavailable(String),
}

/// The identity a validated token resolves to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    /// The portal client.
    pub client_id: ClientId,
    /// The authenticated session.
    pub session_id: SessionId,
}

/// A persisted notification awaiting delivery.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingNotification {
    /// Record ID in the notification store.
    pub id: NotificationId,
    /// The addressed client.
    pub client_id: ClientId,
    /// Opaque payload, exactly as handed to `notify`.
    pub payload: serde_json::Value,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
}

/// Notification persistence service (external).
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Persist a pending notification; returns its record ID.
    async fn create_pending(
        &self,
        client_id: &ClientId,
        payload: &serde_json::Value,
    ) -> Result<NotificationId, CollaboratorError>;

    /// Record that the client's device received the notification.
    /// Idempotent on the store side.
    async fn mark_delivered(&self, id: &NotificationId) -> Result<(), CollaboratorError>;

    /// Record that the client displayed the notification.
    async fn mark_read(&self, id: &NotificationId) -> Result<(), CollaboratorError>;

    /// Undelivered records for a client, oldest first, used to replay
    /// missed items on (re)connect.
    async fn list_undelivered(
        &self,
        client_id: &ClientId,
        limit: usize,
    ) -> Result<Vec<PendingNotification>, CollaboratorError>;
}

/// Identity/session validator (external). Consulted once at admission;
/// the core never re-validates mid-connection.
#[async_trait]
pub trait SessionValidator: Send + Sync {
    /// Resolve a bearer token to an identity.
    async fn validate(&self, token: &str) -> Result<Identity, AuthError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory implementations
// ─────────────────────────────────────────────────────────────────────────────

/// Delivery status of a stored notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotificationStatus {
    /// Created, not yet delivered to any device.
    Pending,
    /// At least one device acknowledged receipt.
    Delivered,
    /// The client displayed it.
    Read,
}

struct StoredNotification {
    record: PendingNotification,
    status: NotificationStatus,
}

/// In-memory notification store for tests and single-node development.
#[derive(Default)]
pub struct MemoryNotificationStore {
    records: DashMap<NotificationId, StoredNotification>,
    /// Per-client IDs in creation order.
    by_client: Mutex<HashMap<ClientId, Vec<NotificationId>>>,
    delivered_writes: std::sync::atomic::AtomicU64,
}

impl MemoryNotificationStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Status of a record, if it exists.
    pub fn status(&self, id: &NotificationId) -> Option<NotificationStatus> {
        self.records.get(id).map(|r| r.status)
    }

    /// How many `mark_delivered` writes have happened (ack idempotency
    /// checks in tests).
    pub fn delivered_writes(&self) -> u64 {
        self.delivered_writes
            .load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[async_trait]
impl NotificationStore for MemoryNotificationStore {
    async fn create_pending(
        &self,
        client_id: &ClientId,
        payload: &serde_json::Value,
    ) -> Result<NotificationId, CollaboratorError> {
        let id = NotificationId::new();
        let record = PendingNotification {
            id: id.clone(),
            client_id: client_id.clone(),
            payload: payload.clone(),
            created_at: Utc::now(),
        };
        let _ = self.records.insert(
            id.clone(),
            StoredNotification {
                record,
                status: NotificationStatus::Pending,
            },
        );
        self.by_client
            .lock()
            .entry(client_id.clone())
            .or_default()
            .push(id.clone());
        Ok(id)
    }

    async fn mark_delivered(&self, id: &NotificationId) -> Result<(), CollaboratorError> {
        if let Some(mut stored) = self.records.get_mut(id) {
            if stored.status == NotificationStatus::Pending {
                stored.status = NotificationStatus::Delivered;
            }
            let _ = self
                .delivered_writes
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        Ok(())
    }

    async fn mark_read(&self, id: &NotificationId) -> Result<(), CollaboratorError> {
        if let Some(mut stored) = self.records.get_mut(id) {
            stored.status = NotificationStatus::Read;
        }
        Ok(())
    }

    async fn list_undelivered(
        &self,
        client_id: &ClientId,
        limit: usize,
    ) -> Result<Vec<PendingNotification>, CollaboratorError> {
        let by_client = self.by_client.lock();
        let Some(ids) = by_client.get(client_id) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| self.records.get(id))
            .filter(|stored| stored.status == NotificationStatus::Pending)
            .take(limit)
            .map(|stored| stored.record.clone())
            .collect())
    }
}

/// Validator backed by a fixed token table. Used in tests and by deployments
/// that provision device tokens out of band.
#[derive(Default)]
pub struct StaticValidator {
    tokens: HashMap<String, Identity>,
}

impl StaticValidator {
    /// Create an empty validator (rejects everything).
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>, identity: Identity) -> Self {
        let _ = self.tokens.insert(token.into(), identity);
        self
    }
}

#[async_trait]
impl SessionValidator for StaticValidator {
    async fn validate(&self, token: &str) -> Result<Identity, AuthError> {
        self.tokens.get(token).cloned().ok_or(AuthError::InvalidToken)
    }
}

/// Development-only validator: the token IS the client ID. Never deploy
/// in production; the portal binary logs a warning when it is active.
pub struct DevValidator;

#[async_trait]
impl SessionValidator for DevValidator {
    async fn validate(&self, token: &str) -> Result<Identity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::InvalidToken);
        }
        Ok(Identity {
            client_id: ClientId::from(token),
            session_id: SessionId::new(),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn create_and_list_undelivered() {
        let store = MemoryNotificationStore::new();
        let client = ClientId::from("42");
        let id1 = store
            .create_pending(&client, &json!({"n": 1}))
            .await
            .unwrap();
        let _id2 = store
            .create_pending(&client, &json!({"n": 2}))
            .await
            .unwrap();

        let pending = store.list_undelivered(&client, 10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, id1, "oldest first");
    }

    #[tokio::test]
    async fn list_respects_limit() {
        let store = MemoryNotificationStore::new();
        let client = ClientId::from("42");
        for n in 0..5 {
            let _ = store.create_pending(&client, &json!({ "n": n })).await.unwrap();
        }
        let pending = store.list_undelivered(&client, 3).await.unwrap();
        assert_eq!(pending.len(), 3);
    }

    #[tokio::test]
    async fn delivered_records_leave_the_undelivered_list() {
        let store = MemoryNotificationStore::new();
        let client = ClientId::from("42");
        let id = store.create_pending(&client, &json!({})).await.unwrap();
        store.mark_delivered(&id).await.unwrap();

        assert!(store.list_undelivered(&client, 10).await.unwrap().is_empty());
        assert_eq!(store.status(&id), Some(NotificationStatus::Delivered));
    }

    #[tokio::test]
    async fn mark_read_upgrades_status() {
        let store = MemoryNotificationStore::new();
        let client = ClientId::from("42");
        let id = store.create_pending(&client, &json!({})).await.unwrap();
        store.mark_delivered(&id).await.unwrap();
        store.mark_read(&id).await.unwrap();
        assert_eq!(store.status(&id), Some(NotificationStatus::Read));
    }

    #[tokio::test]
    async fn unknown_client_lists_empty() {
        let store = MemoryNotificationStore::new();
        let pending = store
            .list_undelivered(&ClientId::from("nobody"), 10)
            .await
            .unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn mark_delivered_on_unknown_record_is_noop() {
        let store = MemoryNotificationStore::new();
        store
            .mark_delivered(&NotificationId::from("ghost"))
            .await
            .unwrap();
        assert_eq!(store.delivered_writes(), 0);
    }

    #[tokio::test]
    async fn static_validator_accepts_known_token() {
        let identity = Identity {
            client_id: ClientId::from("42"),
            session_id: SessionId::from("sess_1"),
        };
        let validator = StaticValidator::new().with_token("tok_abc", identity.clone());
        let validated = validator.validate("tok_abc").await.unwrap();
        assert_eq!(validated, identity);
    }

    #[tokio::test]
    async fn static_validator_rejects_unknown_token() {
        let validator = StaticValidator::new();
        assert!(matches!(
            validator.validate("nope").await,
            Err(AuthError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn dev_validator_uses_token_as_client() {
        let identity = DevValidator.validate("client_7").await.unwrap();
        assert_eq!(identity.client_id.as_str(), "client_7");
    }

    #[tokio::test]
    async fn dev_validator_rejects_empty_token() {
        assert!(DevValidator.validate("").await.is_err());
    }
}
