//! Error taxonomy for the realtime subsystem.
//!
//! Every failure mode in the delivery path maps to one [`RealtimeError`]
//! variant. None of them is fatal to the process: capacity problems resolve
//! by eviction, unknown connections are a benign race with disconnect,
//! closed connections are an expected terminal send outcome, queue overflow
//! is counted and absorbed, and a missing coordination store degrades the
//! instance to local-only delivery.

use thiserror::Error;

use crate::ids::{ClientId, ConnectionId};

/// Errors raised by the realtime delivery subsystem.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// The per-client connection cap was hit. Recoverable: the oldest
    /// connection has already been evicted to make room.
    #[error("client {client_id} reached the connection cap of {cap}")]
    CapacityExceeded {
        /// Client that hit the cap.
        client_id: ClientId,
        /// The configured per-client cap.
        cap: usize,
    },

    /// The connection ID is not (or no longer) registered. This is a
    /// legitimate race with a concurrent disconnect, logged at debug level.
    #[error("connection {0} is not registered")]
    UnknownConnection(ConnectionId),

    /// The connection has reached its terminal state; sends can never
    /// succeed again.
    #[error("connection {0} is closed")]
    ConnectionClosed(ConnectionId),

    /// The dispatch queue is at capacity and the update was dropped.
    /// Never surfaced to `enqueue` callers; counted instead.
    #[error("dispatch queue full (capacity {capacity})")]
    QueueFull {
        /// Configured queue capacity.
        capacity: usize,
    },

    /// The coordination store could not be reached. The instance keeps
    /// serving local connections; cross-instance fan-out is degraded.
    #[error("coordination store unavailable: {0}")]
    CoordinatorUnavailable(String),
}

impl RealtimeError {
    /// Machine-readable error code for wire error frames.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
            Self::UnknownConnection(_) => "UNKNOWN_CONNECTION",
            Self::ConnectionClosed(_) => "CONNECTION_CLOSED",
            Self::QueueFull { .. } => "QUEUE_FULL",
            Self::CoordinatorUnavailable(_) => "COORDINATOR_UNAVAILABLE",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
