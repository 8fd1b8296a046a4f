//! The realtime service composition root.
//!
//! [`RealtimeService`] owns the registry, dispatcher, keepalive monitor,
//! coordinator, and ack tracker, wired together from injected configuration
//! and collaborator implementations — no implicit singletons. The server
//! crate exposes it over HTTP/WebSocket; tests drive it directly.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use docket_core::{
    ConnectionId, InstanceId, ServerFrame, Update, UpdateId, UpdatePriority, UpdateTarget,
};

use crate::acks::DeliveryAckTracker;
use crate::collaborators::{NotificationStore, SessionValidator};
use crate::connection::ClientConnection;
use crate::coordinator::CrossInstanceCoordinator;
use crate::dispatcher::{DispatcherConfig, DispatcherStats, UpdateDispatcher};
use crate::keepalive::{KeepaliveConfig, KeepaliveMonitor};
use crate::registry::{ConnectionRegistry, RegistryStats};
use crate::store::CoordinationStore;

/// Injected-at-construction configuration for the whole subsystem.
#[derive(Clone, Debug)]
pub struct RealtimeConfig {
    /// Per-client connection cap.
    pub per_client_cap: usize,
    /// Dispatch queue capacity.
    pub queue_capacity: usize,
    /// Dispatch worker count.
    pub dispatch_workers: usize,
    /// Per-send timeout on the dispatch path.
    pub send_timeout: Duration,
    /// Per-connection outbound channel capacity.
    pub outbound_buffer: usize,
    /// Keepalive scan interval.
    pub scan_interval: Duration,
    /// Probe connections idle longer than this.
    pub ping_idle: Duration,
    /// Evict connections idle longer than this.
    pub idle_timeout: Duration,
    /// Presence record TTL (slightly longer than `idle_timeout`).
    pub presence_ttl: Duration,
    /// Max notifications replayed on (re)connect.
    pub replay_limit: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            per_client_cap: 5,
            queue_capacity: 256,
            dispatch_workers: 4,
            send_timeout: Duration::from_millis(500),
            outbound_buffer: 64,
            scan_interval: Duration::from_secs(30),
            ping_idle: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(300),
            presence_ttl: Duration::from_secs(330),
            replay_limit: 50,
        }
    }
}

/// Combined counters exposed through `GET /stats`.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStats {
    /// Registry snapshot.
    pub registry: RegistryStats,
    /// Dispatcher counters.
    pub dispatcher: DispatcherStats,
    /// Whether cross-instance fan-out is currently degraded.
    pub coordinator_degraded: bool,
    /// Successful coordinator publishes.
    pub coordinator_publishes: u64,
    /// First-time acknowledgements processed.
    pub acks_total: u64,
}

/// The realtime delivery subsystem, fully wired.
pub struct RealtimeService {
    config: RealtimeConfig,
    registry: Arc<ConnectionRegistry>,
    coordinator: Arc<CrossInstanceCoordinator>,
    dispatcher: Arc<UpdateDispatcher>,
    acks: Arc<DeliveryAckTracker>,
    notifications: Arc<dyn NotificationStore>,
    validator: Arc<dyn SessionValidator>,
}

impl RealtimeService {
    /// Wire the subsystem from configuration and collaborators.
    pub fn new(
        config: RealtimeConfig,
        coordination_store: Arc<dyn CoordinationStore>,
        notifications: Arc<dyn NotificationStore>,
        validator: Arc<dyn SessionValidator>,
    ) -> Arc<Self> {
        let registry = Arc::new(ConnectionRegistry::new(config.per_client_cap));
        let coordinator = Arc::new(CrossInstanceCoordinator::new(
            coordination_store,
            InstanceId::new(),
            config.presence_ttl,
        ));
        let acks = Arc::new(DeliveryAckTracker::new(notifications.clone()));
        let dispatcher = Arc::new(UpdateDispatcher::new(
            registry.clone(),
            coordinator.clone(),
            acks.clone(),
            DispatcherConfig {
                queue_capacity: config.queue_capacity,
                workers: config.dispatch_workers,
                send_timeout: config.send_timeout,
            },
        ));

        Arc::new(Self {
            config,
            registry,
            coordinator,
            dispatcher,
            acks,
            notifications,
            validator,
        })
    }

    /// Start dispatch workers, the keepalive monitor, and the coordinator
    /// subscription. Returns all task handles for graceful shutdown.
    pub fn spawn_background(self: &Arc<Self>, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = self.dispatcher.spawn_workers(cancel);

        let monitor = KeepaliveMonitor::new(
            self.registry.clone(),
            KeepaliveConfig {
                scan_interval: self.config.scan_interval,
                ping_idle: self.config.ping_idle,
                idle_timeout: self.config.idle_timeout,
            },
        );
        handles.push(tokio::spawn(monitor.run(cancel.clone())));

        handles.push(tokio::spawn(
            self.coordinator
                .clone()
                .run_subscription(self.dispatcher.clone(), cancel.clone()),
        ));

        handles
    }

    /// The sole inbound entry point other services use to push an update.
    ///
    /// Client-addressed updates get a pending notification record first so
    /// a disconnected client finds them on reconnect; a store failure is
    /// logged and delivery still proceeds.
    pub async fn notify(
        &self,
        target: UpdateTarget,
        payload: serde_json::Value,
        priority: UpdatePriority,
        expires_at: Option<DateTime<Utc>>,
    ) -> UpdateId {
        let mut update = Update::new(target, payload, priority);
        if let Some(expires_at) = expires_at {
            update = update.with_expiry(expires_at);
        }

        if let Some(client_id) = update.target.client_id().cloned() {
            match self
                .notifications
                .create_pending(&client_id, &update.payload)
                .await
            {
                Ok(notification_id) => update = update.with_notification(notification_id),
                Err(err) => {
                    warn!(%err, client_id = %client_id, "notification store write failed, delivering without replay record");
                }
            }
        }

        let update_id = update.id.clone();
        self.dispatcher.enqueue(update);
        update_id
    }

    /// Process a client acknowledgement.
    pub async fn acknowledge(&self, connection_id: &ConnectionId, update_id: &UpdateId, read: bool) {
        self.acks.acknowledge(connection_id, update_id, read).await;
    }

    /// Replay undelivered notifications to a freshly admitted connection.
    ///
    /// Pushes each record straight to the one connection (not through the
    /// dispatcher — replay is connection-specific, not fan-out). Returns
    /// the number of replayed updates.
    pub async fn replay_undelivered(&self, conn: &Arc<ClientConnection>) -> usize {
        let pending = match self
            .notifications
            .list_undelivered(&conn.client_id, self.config.replay_limit)
            .await
        {
            Ok(pending) => pending,
            Err(err) => {
                warn!(%err, client_id = %conn.client_id, "replay lookup failed");
                return 0;
            }
        };

        let mut replayed = 0;
        for record in pending {
            let update = Update::new(
                UpdateTarget::Client(record.client_id.clone()),
                record.payload.clone(),
                UpdatePriority::Normal,
            )
            .with_notification(record.id.clone());

            self.acks
                .record_delivery(&update.id, update.notification_id.as_ref());
            if conn.try_send(&ServerFrame::Update(update)) {
                replayed += 1;
            } else {
                debug!(connection_id = %conn.id, "replay stopped, outbound channel rejected frame");
                break;
            }
        }

        if replayed > 0 {
            counter!("replayed_updates_total").increment(replayed as u64);
            debug!(connection_id = %conn.id, replayed, "replayed undelivered notifications");
        }
        replayed
    }

    /// Combined counters for observability.
    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            registry: self.registry.stats(),
            dispatcher: self.dispatcher.stats(),
            coordinator_degraded: self.coordinator.is_degraded(),
            coordinator_publishes: self.coordinator.publish_count(),
            acks_total: self.acks.ack_count(),
        }
    }

    /// The connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// The identity validator consulted at admission.
    pub fn validator(&self) -> &Arc<dyn SessionValidator> {
        &self.validator
    }

    /// The cross-instance coordinator.
    pub fn coordinator(&self) -> &Arc<CrossInstanceCoordinator> {
        &self.coordinator
    }

    /// The dispatcher (direct enqueue for advanced callers and tests).
    pub fn dispatcher(&self) -> &Arc<UpdateDispatcher> {
        &self.dispatcher
    }

    /// Service configuration.
    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
