//! Prometheus metrics recorder and `/metrics` endpoint handler.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Must be called once at server startup before any metrics are recorded.
/// Returns `None` if a recorder is already installed (tests, embedding).
pub fn install_recorder() -> Option<PrometheusHandle> {
    let builder = PrometheusBuilder::new();
    match builder.install_recorder() {
        Ok(handle) => {
            info!("prometheus metrics recorder installed");
            Some(handle)
        }
        Err(err) => {
            tracing::warn!(%err, "metrics recorder already installed");
            None
        }
    }
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across crates.

/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections total (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Evictions total (counter, labels: reason).
pub const WS_EVICTIONS_TOTAL: &str = "ws_evictions_total";
/// Connection duration seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Updates accepted by the dispatcher (counter).
pub const DISPATCH_ENQUEUED_TOTAL: &str = "dispatch_enqueued_total";
/// Updates dropped on queue overflow (counter).
pub const DISPATCH_DROPPED_TOTAL: &str = "dispatch_dropped_total";
/// Successful per-connection deliveries (counter).
pub const DISPATCH_DELIVERED_TOTAL: &str = "dispatch_delivered_total";
/// Failed sends that removed their connection (counter).
pub const DISPATCH_SEND_FAILURES_TOTAL: &str = "dispatch_send_failures_total";
/// Updates discarded because they expired before dispatch (counter).
pub const DISPATCH_EXPIRED_TOTAL: &str = "dispatch_expired_total";
/// Successful coordinator publishes (counter).
pub const COORDINATOR_PUBLISHES_TOTAL: &str = "coordinator_publishes_total";
/// Failed coordination store calls (counter).
pub const COORDINATOR_FAILURES_TOTAL: &str = "coordinator_failures_total";
/// First-time acknowledgements (counter).
pub const ACKS_TOTAL: &str = "acks_total";
/// Notifications replayed on reconnect (counter).
pub const REPLAYED_UPDATES_TOTAL: &str = "replayed_updates_total";
