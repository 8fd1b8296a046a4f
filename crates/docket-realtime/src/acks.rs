//! Acknowledgement reconciliation.
//!
//! The dispatcher records every delivery it pushes; clients confirm with
//! `ack` frames. The first acknowledgement of a `(connection, update)` pair
//! forwards delivered (and optionally read) status to the notification
//! store; duplicates and out-of-order acks are accepted and do nothing.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use metrics::counter;
use tracing::debug;

use docket_core::{ConnectionId, NotificationId, UpdateId};

use crate::collaborators::NotificationStore;

/// What one acknowledgement call should do once the pair state is settled.
#[derive(Clone, Copy, PartialEq, Eq)]
enum AckAction {
    First,
    ReadUpgrade,
    Duplicate,
}

/// Tracks pending deliveries and reconciles client acknowledgements.
pub struct DeliveryAckTracker {
    store: Arc<dyn NotificationStore>,
    /// Update → backing notification record, registered at dispatch time.
    pending: DashMap<UpdateId, NotificationId>,
    /// Pairs already acknowledged; the value records whether `read` was
    /// already forwarded.
    acked: DashMap<(ConnectionId, UpdateId), bool>,
    acks: AtomicU64,
    duplicate_acks: AtomicU64,
}

impl DeliveryAckTracker {
    /// Create a tracker forwarding status to the given store.
    pub fn new(store: Arc<dyn NotificationStore>) -> Self {
        Self {
            store,
            pending: DashMap::new(),
            acked: DashMap::new(),
            acks: AtomicU64::new(0),
            duplicate_acks: AtomicU64::new(0),
        }
    }

    /// Register a delivery the dispatcher just pushed. Updates without a
    /// backing notification record (group-only fan-out) are not tracked.
    pub fn record_delivery(&self, update_id: &UpdateId, notification_id: Option<&NotificationId>) {
        if let Some(notification_id) = notification_id {
            let _ = self
                .pending
                .insert(update_id.clone(), notification_id.clone());
        }
    }

    /// Process a client acknowledgement. Idempotent: re-acknowledging the
    /// same pair is a no-op; `read` may upgrade an earlier delivered-only
    /// ack exactly once.
    pub async fn acknowledge(&self, connection_id: &ConnectionId, update_id: &UpdateId, read: bool) {
        use dashmap::mapref::entry::Entry;

        // Decide atomically; the store calls happen after the guard drops.
        let action = match self.acked.entry((connection_id.clone(), update_id.clone())) {
            Entry::Vacant(vacant) => {
                let _ = vacant.insert(read);
                AckAction::First
            }
            Entry::Occupied(mut occupied) => {
                if read && !*occupied.get() {
                    *occupied.get_mut() = true;
                    AckAction::ReadUpgrade
                } else {
                    AckAction::Duplicate
                }
            }
        };

        match action {
            AckAction::Duplicate | AckAction::ReadUpgrade => {
                let _ = self.duplicate_acks.fetch_add(1, Ordering::Relaxed);
            }
            AckAction::First => {
                let _ = self.acks.fetch_add(1, Ordering::Relaxed);
                counter!("acks_total").increment(1);
            }
        }
        if action == AckAction::Duplicate {
            return;
        }

        let Some(notification_id) = self.pending.get(update_id).map(|e| e.value().clone()) else {
            // Unknown update: replay from another instance, an expired
            // pending entry, or a client re-acking after reconnect.
            debug!(update_id = %update_id, "ack for untracked update");
            return;
        };

        if action == AckAction::First {
            if let Err(err) = self.store.mark_delivered(&notification_id).await {
                debug!(%err, update_id = %update_id, "mark_delivered failed");
            }
        }
        if read {
            if let Err(err) = self.store.mark_read(&notification_id).await {
                debug!(%err, update_id = %update_id, "mark_read failed");
            }
        }
    }

    /// Total first-time acknowledgements processed.
    pub fn ack_count(&self) -> u64 {
        self.acks.load(Ordering::Relaxed)
    }

    /// Total duplicate acknowledgements absorbed.
    pub fn duplicate_count(&self) -> u64 {
        self.duplicate_acks.load(Ordering::Relaxed)
    }

    /// Deliveries awaiting acknowledgement.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{MemoryNotificationStore, NotificationStatus, NotificationStore};
    use docket_core::ClientId;
    use serde_json::json;

    async fn tracked_update(
        store: &Arc<MemoryNotificationStore>,
        tracker: &DeliveryAckTracker,
    ) -> (UpdateId, NotificationId) {
        let notification_id = store
            .create_pending(&ClientId::from("42"), &json!({}))
            .await
            .unwrap();
        let update_id = UpdateId::new();
        tracker.record_delivery(&update_id, Some(&notification_id));
        (update_id, notification_id)
    }

    #[tokio::test]
    async fn first_ack_marks_delivered() {
        let store = Arc::new(MemoryNotificationStore::new());
        let tracker = DeliveryAckTracker::new(store.clone());
        let (update_id, notification_id) = tracked_update(&store, &tracker).await;

        tracker
            .acknowledge(&ConnectionId::from("c1"), &update_id, false)
            .await;

        assert_eq!(
            store.status(&notification_id),
            Some(NotificationStatus::Delivered)
        );
        assert_eq!(store.delivered_writes(), 1);
        assert_eq!(tracker.ack_count(), 1);
    }

    #[tokio::test]
    async fn duplicate_ack_is_one_write() {
        let store = Arc::new(MemoryNotificationStore::new());
        let tracker = DeliveryAckTracker::new(store.clone());
        let (update_id, _) = tracked_update(&store, &tracker).await;

        let conn = ConnectionId::from("c1");
        tracker.acknowledge(&conn, &update_id, false).await;
        tracker.acknowledge(&conn, &update_id, false).await;

        assert_eq!(store.delivered_writes(), 1, "second ack writes nothing");
        assert_eq!(tracker.ack_count(), 1);
        assert_eq!(tracker.duplicate_count(), 1);
    }

    #[tokio::test]
    async fn ack_with_read_marks_read() {
        let store = Arc::new(MemoryNotificationStore::new());
        let tracker = DeliveryAckTracker::new(store.clone());
        let (update_id, notification_id) = tracked_update(&store, &tracker).await;

        tracker
            .acknowledge(&ConnectionId::from("c1"), &update_id, true)
            .await;
        assert_eq!(store.status(&notification_id), Some(NotificationStatus::Read));
    }

    #[tokio::test]
    async fn read_upgrade_after_delivered_ack() {
        let store = Arc::new(MemoryNotificationStore::new());
        let tracker = DeliveryAckTracker::new(store.clone());
        let (update_id, notification_id) = tracked_update(&store, &tracker).await;

        let conn = ConnectionId::from("c1");
        tracker.acknowledge(&conn, &update_id, false).await;
        tracker.acknowledge(&conn, &update_id, true).await;

        assert_eq!(store.status(&notification_id), Some(NotificationStatus::Read));
        assert_eq!(store.delivered_writes(), 1);
    }

    #[tokio::test]
    async fn ack_for_unknown_update_is_accepted() {
        let store = Arc::new(MemoryNotificationStore::new());
        let tracker = DeliveryAckTracker::new(store);

        // Must not panic or error; out-of-order acks are legitimate.
        tracker
            .acknowledge(&ConnectionId::from("c1"), &UpdateId::from("ghost"), false)
            .await;
        assert_eq!(tracker.ack_count(), 1);
    }

    #[tokio::test]
    async fn untracked_delivery_is_not_pending() {
        let store = Arc::new(MemoryNotificationStore::new());
        let tracker = DeliveryAckTracker::new(store);
        tracker.record_delivery(&UpdateId::new(), None);
        assert_eq!(tracker.pending_len(), 0);
    }

    #[tokio::test]
    async fn acks_from_different_connections_both_count() {
        let store = Arc::new(MemoryNotificationStore::new());
        let tracker = DeliveryAckTracker::new(store.clone());
        let (update_id, _) = tracked_update(&store, &tracker).await;

        // Two devices of the same client ack the same update.
        tracker
            .acknowledge(&ConnectionId::from("c1"), &update_id, false)
            .await;
        tracker
            .acknowledge(&ConnectionId::from("c2"), &update_id, false)
            .await;

        assert_eq!(tracker.ack_count(), 2);
        // The store absorbs the second delivered write idempotently.
        assert_eq!(
            store.status(&tracker.pending.get(&update_id).unwrap().value().clone()),
            Some(NotificationStatus::Delivered)
        );
    }
}
