//! Liveness monitoring.
//!
//! One periodic task scans every registered connection. Connections idle
//! past the timeout are evicted and closed; connections merely idle past
//! the ping threshold get a transport-level probe. A probe never refreshes
//! the liveness timestamp — only inbound traffic does — so a probe alone
//! cannot keep a half-dead connection alive indefinitely.
//!
//! The monitor is deliberately separate from the dispatcher: a backlog of
//! undelivered updates must never block liveness scanning, and vice versa.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::registry::{ConnectionRegistry, RemoveReason};

/// Keepalive thresholds.
#[derive(Clone, Debug)]
pub struct KeepaliveConfig {
    /// How often the scan runs.
    pub scan_interval: Duration,
    /// Probe connections idle longer than this.
    pub ping_idle: Duration,
    /// Evict connections idle longer than this.
    pub idle_timeout: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(30),
            ping_idle: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// What one scan pass did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    /// Connections evicted for exceeding the idle timeout.
    pub evicted: usize,
    /// Probes sent to idle connections.
    pub probed: usize,
}

/// Periodically pings idle connections and evicts dead ones.
pub struct KeepaliveMonitor {
    registry: Arc<ConnectionRegistry>,
    config: KeepaliveConfig,
}

impl KeepaliveMonitor {
    /// Create a monitor over the given registry.
    pub fn new(registry: Arc<ConnectionRegistry>, config: KeepaliveConfig) -> Self {
        Self { registry, config }
    }

    /// Run until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = time::interval(self.config.scan_interval);
        // Skip the immediate first tick.
        let _ = interval.tick().await;

        info!(
            scan_interval_secs = self.config.scan_interval.as_secs(),
            idle_timeout_secs = self.config.idle_timeout.as_secs(),
            "keepalive monitor started"
        );
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let outcome = self.scan_once();
                    if outcome.evicted > 0 {
                        debug!(evicted = outcome.evicted, probed = outcome.probed, "keepalive scan");
                    }
                }
            }
        }
        info!("keepalive monitor stopped");
    }

    /// One scan pass over a registry snapshot.
    pub fn scan_once(&self) -> ScanOutcome {
        let mut outcome = ScanOutcome::default();

        for conn in self.registry.snapshot() {
            let idle = conn.idle_for();

            if idle >= self.config.idle_timeout {
                let _ = self.registry.remove(&conn.id, RemoveReason::Timeout);
                outcome.evicted += 1;
            } else if idle >= self.config.ping_idle && conn.is_connected() {
                if conn.send_probe() {
                    outcome.probed += 1;
                } else {
                    // Cannot even enqueue a probe: the connection is dead.
                    let _ = self.registry.remove(&conn.id, RemoveReason::SendFailure);
                    outcome.evicted += 1;
                }
            }
        }

        outcome
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
