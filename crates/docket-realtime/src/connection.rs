//! Client connection state and outbound-send serialization.
//!
//! One [`ClientConnection`] wraps one live bidirectional connection to one
//! client device. All outbound traffic goes through a bounded mpsc channel
//! drained by a single writer task, which preserves per-connection delivery
//! order. The liveness timestamp and lifecycle state are single-writer:
//! only the registry, the keepalive monitor, or the connection's own
//! session loop mutate them.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use docket_core::{ClientId, ConnectionId, GroupName, ServerFrame, SessionId};

/// Connection lifecycle.
///
/// `Connecting → Connected → Draining → Closed`, with a direct
/// `Connected → Closed` shortcut on abrupt transport failure. `Closed` is
/// terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Constructed, transport handshake not yet confirmed.
    Connecting,
    /// Fully admitted; the only state in which updates are deliverable.
    Connected,
    /// Eviction/logout/timeout decided; close handshake pending.
    Draining,
    /// Terminal. Sends return `ConnectionClosed`, the registry no longer
    /// resolves this connection.
    Closed,
}

/// Messages carried on the per-connection outbound channel.
#[derive(Clone, Debug)]
pub enum OutboundMessage {
    /// A serialized [`ServerFrame`], shared across fan-out targets.
    Frame(Arc<String>),
    /// A transport-level liveness probe (WebSocket Ping).
    Probe,
}

/// Connection metadata captured at upgrade time.
#[derive(Clone, Debug, Default)]
pub struct ConnectionMeta {
    /// Origin address of the peer.
    pub remote_addr: Option<String>,
    /// Client agent string.
    pub user_agent: Option<String>,
}

/// Represents one connected portal client device.
pub struct ClientConnection {
    /// Unique connection ID.
    pub id: ConnectionId,
    /// Owning portal client.
    pub client_id: ClientId,
    /// The authenticated session this connection belongs to.
    pub session_id: SessionId,
    /// When this connection was established.
    pub opened_at: Instant,
    /// Connection metadata (origin address, agent string).
    pub meta: ConnectionMeta,
    /// Cancelled to tear the session loops down (eviction, shutdown).
    cancel: CancellationToken,
    state: Mutex<ConnectionState>,
    /// When the last inbound traffic (any frame, including pong) arrived.
    last_activity: Mutex<Instant>,
    /// Groups this connection belongs to; mutated only by the registry.
    groups: Mutex<HashSet<GroupName>>,
    tx: mpsc::Sender<OutboundMessage>,
    /// Count of messages dropped due to a full channel.
    dropped_messages: AtomicU64,
}

impl ClientConnection {
    /// Create a new connection in `Connecting` state.
    pub fn new(
        client_id: ClientId,
        session_id: SessionId,
        tx: mpsc::Sender<OutboundMessage>,
        meta: ConnectionMeta,
    ) -> Self {
        let now = Instant::now();
        Self {
            id: ConnectionId::new(),
            client_id,
            session_id,
            opened_at: now,
            meta,
            cancel: CancellationToken::new(),
            state: Mutex::new(ConnectionState::Connecting),
            last_activity: Mutex::new(now),
            groups: Mutex::new(HashSet::new()),
            tx,
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Whether updates are deliverable to this connection.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Transport handshake confirmed: `Connecting → Connected`.
    ///
    /// Returns `false` if the connection already left `Connecting`.
    pub fn mark_connected(&self) -> bool {
        let mut state = self.state.lock();
        if *state == ConnectionState::Connecting {
            *state = ConnectionState::Connected;
            true
        } else {
            false
        }
    }

    /// Eviction/logout/timeout decided: `Connected → Draining`.
    ///
    /// Cancels the session loops so the close handshake runs. Returns
    /// `false` if the connection was not `Connected`.
    pub fn begin_drain(&self) -> bool {
        let drained = {
            let mut state = self.state.lock();
            if *state == ConnectionState::Connected {
                *state = ConnectionState::Draining;
                true
            } else {
                false
            }
        };
        if drained {
            self.cancel.cancel();
        }
        drained
    }

    /// Terminal transition from any non-closed state.
    ///
    /// Returns `false` if already closed.
    pub fn close(&self) -> bool {
        let closed = {
            let mut state = self.state.lock();
            if *state == ConnectionState::Closed {
                false
            } else {
                *state = ConnectionState::Closed;
                true
            }
        };
        if closed {
            self.cancel.cancel();
        }
        closed
    }

    /// Token cancelled when the connection should tear down.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Record inbound traffic (refreshes the liveness window).
    pub fn mark_active(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time since the last inbound traffic.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }

    /// Groups this connection is subscribed to.
    pub fn groups(&self) -> HashSet<GroupName> {
        self.groups.lock().clone()
    }

    pub(crate) fn add_group(&self, group: GroupName) {
        let _ = self.groups.lock().insert(group);
    }

    pub(crate) fn remove_group(&self, group: &GroupName) -> bool {
        self.groups.lock().remove(group)
    }

    /// Enqueue a frame without blocking.
    ///
    /// Returns `false` if the connection is closed or the channel is full;
    /// a full channel increments the dropped-message counter.
    pub fn try_send(&self, frame: &ServerFrame) -> bool {
        if self.state() == ConnectionState::Closed {
            return false;
        }
        let json = Arc::new(frame.to_json());
        if self.tx.try_send(OutboundMessage::Frame(json)).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Enqueue an already-serialized frame with a short timeout.
    ///
    /// This is the dispatcher's send path: the frame is serialized once per
    /// update and shared across all fan-out targets. Returns `false` on a
    /// closed connection, a closed channel, or timeout — the caller treats
    /// any failure as evidence of a dead connection.
    pub async fn send_timeout(&self, json: Arc<String>, timeout: Duration) -> bool {
        if self.state() != ConnectionState::Connected {
            return false;
        }
        self.tx
            .send_timeout(OutboundMessage::Frame(json), timeout)
            .await
            .is_ok()
    }

    /// Enqueue a transport-level liveness probe.
    pub fn send_probe(&self) -> bool {
        if self.state() == ConnectionState::Closed {
            return false;
        }
        self.tx.try_send(OutboundMessage::Probe).is_ok()
    }

    /// Total messages dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
