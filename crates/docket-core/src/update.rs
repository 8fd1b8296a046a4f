//! The [`Update`] value type — one unit of realtime information.
//!
//! An update is immutable once created. It names a target (a client, a
//! subscription group, or both), carries an opaque payload with a delivery
//! priority, and may expire. The dispatcher consumes it exactly once at
//! resolution time; it may fan out to zero, one, or many connections.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{ClientId, GroupName, NotificationId, UpdateId};

/// Delivery priority. Higher priorities survive queue overflow longer.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum UpdatePriority {
    /// Droppable first under pressure (e.g. typing indicators).
    Low,
    /// Default priority.
    #[default]
    Normal,
    /// Kept over normal traffic (e.g. new invoice, message received).
    High,
    /// Dropped last (e.g. appointment starting, deadline alerts).
    Urgent,
}

/// A target that names neither a client nor a group.
#[derive(Clone, Copy, Debug, Error)]
#[error("update target must name a client id, a group, or both")]
pub struct InvalidTarget;

/// Where an update is addressed. At least one of client/group is always set;
/// the enum makes the invariant unrepresentable rather than checked.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawTarget", into = "RawTarget")]
pub enum UpdateTarget {
    /// All of one client's connections.
    Client(ClientId),
    /// All members of a subscription group.
    Group(GroupName),
    /// Union of both.
    Both(ClientId, GroupName),
}

impl UpdateTarget {
    /// Build from optional parts, requiring at least one.
    pub fn from_parts(
        client: Option<ClientId>,
        group: Option<GroupName>,
    ) -> Result<Self, InvalidTarget> {
        match (client, group) {
            (Some(c), Some(g)) => Ok(Self::Both(c, g)),
            (Some(c), None) => Ok(Self::Client(c)),
            (None, Some(g)) => Ok(Self::Group(g)),
            (None, None) => Err(InvalidTarget),
        }
    }

    /// The targeted client, if any.
    #[must_use]
    pub fn client_id(&self) -> Option<&ClientId> {
        match self {
            Self::Client(c) | Self::Both(c, _) => Some(c),
            Self::Group(_) => None,
        }
    }

    /// The targeted group, if any.
    #[must_use]
    pub fn group(&self) -> Option<&GroupName> {
        match self {
            Self::Group(g) | Self::Both(_, g) => Some(g),
            Self::Client(_) => None,
        }
    }
}

/// Wire shape for [`UpdateTarget`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTarget {
    #[serde(skip_serializing_if = "Option::is_none")]
    client_id: Option<ClientId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    group: Option<GroupName>,
}

impl TryFrom<RawTarget> for UpdateTarget {
    type Error = InvalidTarget;

    fn try_from(raw: RawTarget) -> Result<Self, Self::Error> {
        Self::from_parts(raw.client_id, raw.group)
    }
}

impl From<UpdateTarget> for RawTarget {
    fn from(target: UpdateTarget) -> Self {
        match target {
            UpdateTarget::Client(c) => Self {
                client_id: Some(c),
                group: None,
            },
            UpdateTarget::Group(g) => Self {
                client_id: None,
                group: Some(g),
            },
            UpdateTarget::Both(c, g) => Self {
                client_id: Some(c),
                group: Some(g),
            },
        }
    }
}

/// One unit of realtime information destined for a client and/or group.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Update {
    /// Unique update identifier (`updateId` on the wire, matching the
    /// `ack` frame's reference).
    #[serde(rename = "updateId")]
    pub id: UpdateId,
    /// Addressing (flattened to `clientId`/`group` on the wire).
    #[serde(flatten)]
    pub target: UpdateTarget,
    /// Opaque structured payload; the transport never inspects it.
    pub payload: serde_json::Value,
    /// Delivery priority.
    pub priority: UpdatePriority,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Optional expiry; expired updates are not delivered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// The persisted notification record backing this update, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification_id: Option<NotificationId>,
    /// Set when this update arrived from another instance via the
    /// coordinator; such updates are never re-published.
    #[serde(skip)]
    pub from_remote: bool,
}

impl Update {
    /// Create a new update with a fresh ID and the current timestamp.
    #[must_use]
    pub fn new(target: UpdateTarget, payload: serde_json::Value, priority: UpdatePriority) -> Self {
        Self {
            id: UpdateId::new(),
            target,
            payload,
            priority,
            created_at: Utc::now(),
            expires_at: None,
            notification_id: None,
            from_remote: false,
        }
    }

    /// Attach an expiry timestamp.
    #[must_use]
    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Attach the backing notification record.
    #[must_use]
    pub fn with_notification(mut self, notification_id: NotificationId) -> Self {
        self.notification_id = Some(notification_id);
        self
    }

    /// Mark as remote-origin (fed back from the coordinator).
    #[must_use]
    pub fn into_remote(mut self) -> Self {
        self.from_remote = true;
        self
    }

    /// Whether the update has expired as of `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|e| e <= now)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
