//! Server configuration.

use std::time::Duration;

use docket_realtime::RealtimeConfig;
use docket_settings::DocketSettings;
use serde::{Deserialize, Serialize};

/// Configuration for the Docket server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_message_size: 256 * 1024,
        }
    }
}

impl ServerConfig {
    /// Build from loaded settings.
    #[must_use]
    pub fn from_settings(settings: &DocketSettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            max_message_size: settings.server.max_message_size,
        }
    }
}

/// Map loaded settings onto the realtime subsystem configuration.
#[must_use]
pub fn realtime_config(settings: &DocketSettings) -> RealtimeConfig {
    let rt = &settings.realtime;
    RealtimeConfig {
        per_client_cap: rt.per_client_cap,
        queue_capacity: rt.queue_capacity,
        dispatch_workers: rt.dispatch_workers,
        send_timeout: Duration::from_millis(rt.send_timeout_ms),
        outbound_buffer: rt.outbound_buffer,
        scan_interval: Duration::from_millis(rt.scan_interval_ms),
        ping_idle: Duration::from_millis(rt.ping_idle_ms),
        idle_timeout: Duration::from_millis(rt.idle_timeout_ms),
        presence_ttl: Duration::from_millis(rt.presence_ttl_ms),
        replay_limit: rt.replay_limit,
    }
}
