//! Cross-instance coordination.
//!
//! Makes the union of all running instances behave like one registry: every
//! locally-raised update is published as an [`Envelope`] on the coordination
//! store, and every instance feeds foreign-origin envelopes back into its
//! own dispatcher with the remote flag set so they are never re-published.
//!
//! Presence records (`presence/{client}/{connection}`) carry a TTL slightly
//! longer than the keepalive timeout so a crashed instance's clients
//! self-expire. A missing store degrades the instance to local-only
//! delivery; it never takes the instance down.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use docket_core::{ClientId, ConnectionId, InstanceId, RealtimeError, Update};

use crate::dispatcher::UpdateDispatcher;
use crate::store::{CoordinationStore, Envelope};

/// Longest pause between subscription reconnect attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Publishes presence and update events to the shared coordination store
/// and feeds remote updates into the local dispatcher.
pub struct CrossInstanceCoordinator {
    store: Arc<dyn CoordinationStore>,
    instance_id: InstanceId,
    presence_ttl: Duration,
    degraded: AtomicBool,
    publishes: AtomicU64,
    failures: AtomicU64,
}

impl CrossInstanceCoordinator {
    /// Create a coordinator for this instance.
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        instance_id: InstanceId,
        presence_ttl: Duration,
    ) -> Self {
        Self {
            store,
            instance_id,
            presence_ttl,
            degraded: AtomicBool::new(false),
            publishes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// This instance's identity (the origin stamped on envelopes).
    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// Whether the store is currently unreachable (local-only mode).
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Successful publishes so far.
    pub fn publish_count(&self) -> u64 {
        self.publishes.load(Ordering::Relaxed)
    }

    /// Failed store calls so far.
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Publish an update for other instances.
    ///
    /// The broadcast key is the client ID when present, the group name
    /// otherwise. Failure degrades to local-only mode and is reported as
    /// [`RealtimeError::CoordinatorUnavailable`]; callers treat it as
    /// best-effort.
    pub async fn publish(&self, update: &Update) -> Result<(), RealtimeError> {
        let envelope = Envelope {
            origin: self.instance_id.clone(),
            update: update.clone(),
        };
        let payload = serde_json::to_string(&envelope)
            .map_err(|e| RealtimeError::CoordinatorUnavailable(e.to_string()))?;

        let key = match update.target.client_id() {
            Some(client_id) => format!("client/{client_id}"),
            None => update
                .target
                .group()
                .map_or_else(String::new, |g| format!("group/{g}")),
        };

        match self.store.publish(&key, payload).await {
            Ok(()) => {
                let _ = self.publishes.fetch_add(1, Ordering::Relaxed);
                counter!("coordinator_publishes_total").increment(1);
                self.mark_healthy();
                Ok(())
            }
            Err(err) => {
                self.mark_degraded(&err.to_string());
                Err(RealtimeError::CoordinatorUnavailable(err.to_string()))
            }
        }
    }

    /// Announce (or refresh) presence of a connection.
    pub async fn announce_presence(
        &self,
        client_id: &ClientId,
        connection_id: &ConnectionId,
    ) -> Result<(), RealtimeError> {
        let key = presence_key(client_id, connection_id);
        let value = serde_json::json!({
            "instanceId": self.instance_id,
            "lastSeen": Utc::now().to_rfc3339(),
        })
        .to_string();

        match self.store.put(&key, value, self.presence_ttl).await {
            Ok(()) => {
                self.mark_healthy();
                Ok(())
            }
            Err(err) => {
                self.mark_degraded(&err.to_string());
                Err(RealtimeError::CoordinatorUnavailable(err.to_string()))
            }
        }
    }

    /// Remove a connection's presence record.
    pub async fn revoke_presence(
        &self,
        client_id: &ClientId,
        connection_id: &ConnectionId,
    ) -> Result<(), RealtimeError> {
        let key = presence_key(client_id, connection_id);
        match self.store.delete(&key).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.mark_degraded(&err.to_string());
                Err(RealtimeError::CoordinatorUnavailable(err.to_string()))
            }
        }
    }

    /// Run the subscription loop until cancelled.
    ///
    /// Foreign-origin envelopes are re-enqueued locally with the remote
    /// flag; own-origin envelopes are skipped (that is what prevents
    /// publish loops). A dropped subscription reconnects with jittered
    /// exponential backoff.
    pub async fn run_subscription(
        self: Arc<Self>,
        dispatcher: Arc<UpdateDispatcher>,
        cancel: CancellationToken,
    ) {
        let mut backoff = Duration::from_millis(500);

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.store.subscribe().await {
                Ok(mut rx) => {
                    self.mark_healthy();
                    backoff = Duration::from_millis(500);
                    loop {
                        tokio::select! {
                            () = cancel.cancelled() => return,
                            received = rx.recv() => match received {
                                Some((key, payload)) => self.handle_envelope(&key, &payload, &dispatcher),
                                None => {
                                    warn!("coordination subscription closed, reconnecting");
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(err) => {
                    self.mark_degraded(&err.to_string());
                }
            }

            let jitter = Duration::from_millis(rand::rng().random_range(0..250));
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(backoff + jitter) => {}
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    fn handle_envelope(&self, key: &str, payload: &str, dispatcher: &Arc<UpdateDispatcher>) {
        let envelope: Envelope = match serde_json::from_str(payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(%err, key, "discarding malformed coordination envelope");
                return;
            }
        };
        if envelope.origin == self.instance_id {
            return;
        }
        debug!(
            key,
            origin = %envelope.origin,
            update_id = %envelope.update.id,
            "remote update received"
        );
        dispatcher.enqueue(envelope.update.into_remote());
    }

    fn mark_healthy(&self) {
        if self.degraded.swap(false, Ordering::Relaxed) {
            info!("coordination store reachable again, cross-instance fan-out restored");
        }
    }

    fn mark_degraded(&self, reason: &str) {
        let _ = self.failures.fetch_add(1, Ordering::Relaxed);
        counter!("coordinator_failures_total").increment(1);
        if !self.degraded.swap(true, Ordering::Relaxed) {
            warn!(reason, "coordination store unreachable, serving local connections only");
        }
    }
}

fn presence_key(client_id: &ClientId, connection_id: &ConnectionId) -> String {
    format!("presence/{client_id}/{connection_id}")
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
