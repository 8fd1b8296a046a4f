//! Update dispatch: a bounded intake queue and a pool of delivery workers.
//!
//! Producers enqueue fire-and-forget; the queue never blocks them. Under
//! overflow the lowest-priority pending update goes first (the incoming one
//! if it is itself the lowest), and every drop is counted — never silent.
//!
//! Workers resolve each update's targets through the registry, push with a
//! short per-send timeout, and treat a failed send as a dead connection:
//! the connection is removed, the send is not retried. Local delivery and
//! cross-instance publication are independent — a locally-originated update
//! is always handed to the coordinator, even when local resolution was
//! empty, because the same client may hold connections on several
//! instances at once.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use docket_core::{RealtimeError, ServerFrame, Update};

use crate::acks::DeliveryAckTracker;
use crate::coordinator::CrossInstanceCoordinator;
use crate::registry::{ConnectionRegistry, RemoveReason};

/// Dispatcher tuning.
#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// Intake queue capacity.
    pub queue_capacity: usize,
    /// Number of worker tasks.
    pub workers: usize,
    /// Per-send timeout on the delivery path.
    pub send_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            workers: 4,
            send_timeout: Duration::from_millis(500),
        }
    }
}

/// Dispatcher counters for observability.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatcherStats {
    /// Updates currently waiting in the intake queue.
    pub queued: usize,
    /// Total updates accepted.
    pub enqueued_total: u64,
    /// Total updates dropped on overflow.
    pub dropped_total: u64,
    /// Total successful per-connection deliveries.
    pub delivered_total: u64,
    /// Total sends that failed (and removed their connection).
    pub send_failures_total: u64,
    /// Total updates discarded because they expired before dispatch.
    pub expired_total: u64,
}

/// Decouples producers of updates from the synchronous cost of fan-out.
pub struct UpdateDispatcher {
    registry: Arc<ConnectionRegistry>,
    coordinator: Arc<CrossInstanceCoordinator>,
    acks: Arc<DeliveryAckTracker>,
    config: DispatcherConfig,
    queue: Mutex<VecDeque<Update>>,
    notify: Notify,
    enqueued: AtomicU64,
    dropped: AtomicU64,
    delivered: AtomicU64,
    send_failures: AtomicU64,
    expired: AtomicU64,
}

impl UpdateDispatcher {
    /// Create a dispatcher. Workers are started separately with
    /// [`spawn_workers`](Self::spawn_workers).
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        coordinator: Arc<CrossInstanceCoordinator>,
        acks: Arc<DeliveryAckTracker>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            registry,
            coordinator,
            acks,
            config,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            enqueued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    /// Accept an update. Fire-and-forget: never blocks, never errors.
    ///
    /// On a full queue the lowest-priority pending update is dropped first
    /// (oldest wins the tie); an incoming update that is itself the lowest
    /// is the one discarded.
    pub fn enqueue(&self, update: Update) {
        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.config.queue_capacity {
                let lowest = queue
                    .iter()
                    .enumerate()
                    .min_by_key(|(index, pending)| (pending.priority, *index))
                    .map(|(index, pending)| (index, pending.priority));

                let err = RealtimeError::QueueFull {
                    capacity: self.config.queue_capacity,
                };
                match lowest {
                    Some((_, lowest_priority)) if update.priority < lowest_priority => {
                        debug!(%err, update_id = %update.id, "dropping incoming update");
                        self.count_drop();
                        return;
                    }
                    Some((index, _)) => {
                        if let Some(victim) = queue.remove(index) {
                            debug!(%err, update_id = %victim.id, "dropping pending update");
                        }
                        self.count_drop();
                    }
                    None => {
                        // Capacity zero; nothing sane to do but drop.
                        self.count_drop();
                        return;
                    }
                }
            }
            queue.push_back(update);
            let _ = self.enqueued.fetch_add(1, Ordering::Relaxed);
            counter!("dispatch_enqueued_total").increment(1);
        }
        self.notify.notify_one();
    }

    /// Start the worker pool. Returns the task handles for shutdown.
    pub fn spawn_workers(self: &Arc<Self>, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.config.workers.max(1))
            .map(|worker| {
                let dispatcher = Arc::clone(self);
                let cancel = cancel.clone();
                tokio::spawn(async move { dispatcher.worker_loop(worker, cancel).await })
            })
            .collect()
    }

    /// Current counters.
    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            queued: self.queue.lock().len(),
            enqueued_total: self.enqueued.load(Ordering::Relaxed),
            dropped_total: self.dropped.load(Ordering::Relaxed),
            delivered_total: self.delivered.load(Ordering::Relaxed),
            send_failures_total: self.send_failures.load(Ordering::Relaxed),
            expired_total: self.expired.load(Ordering::Relaxed),
        }
    }

    #[instrument(skip_all, fields(worker))]
    async fn worker_loop(&self, worker: usize, cancel: CancellationToken) {
        debug!(worker, "dispatch worker started");
        loop {
            while let Some(update) = self.pop() {
                self.process(update).await;
            }
            tokio::select! {
                () = cancel.cancelled() => break,
                () = self.notify.notified() => {}
            }
        }
        debug!(worker, "dispatch worker stopped");
    }

    fn pop(&self) -> Option<Update> {
        self.queue.lock().pop_front()
    }

    /// Deliver one update: local fan-out plus cross-instance publication.
    async fn process(&self, update: Update) {
        if update.is_expired(Utc::now()) {
            let _ = self.expired.fetch_add(1, Ordering::Relaxed);
            counter!("dispatch_expired_total").increment(1);
            debug!(update_id = %update.id, "discarding expired update");
            return;
        }

        let targets = self
            .registry
            .resolve_targets(update.target.client_id(), update.target.group());

        if !targets.is_empty() {
            let frame = Arc::new(ServerFrame::Update(update.clone()).to_json());
            for conn in targets {
                if conn
                    .send_timeout(frame.clone(), self.config.send_timeout)
                    .await
                {
                    let _ = self.delivered.fetch_add(1, Ordering::Relaxed);
                    counter!("dispatch_delivered_total").increment(1);
                    self.acks
                        .record_delivery(&update.id, update.notification_id.as_ref());
                } else {
                    // A failed send is evidence of a dead connection, not a
                    // retryable error.
                    let _ = self.send_failures.fetch_add(1, Ordering::Relaxed);
                    counter!("dispatch_send_failures_total").increment(1);
                    debug!(
                        connection_id = %conn.id,
                        update_id = %update.id,
                        "send failed, removing connection"
                    );
                    let _ = self.registry.remove(&conn.id, RemoveReason::SendFailure);
                }
            }
        }

        // Local delivery and cross-instance publication are independent;
        // remote-origin updates stop here to avoid propagation loops.
        if !update.from_remote {
            let _ = self.coordinator.publish(&update).await;
        }
    }

    fn count_drop(&self) {
        let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
        counter!("dispatch_dropped_total").increment(1);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
