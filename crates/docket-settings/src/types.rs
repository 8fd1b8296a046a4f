//! Settings types with serde defaults.
//!
//! Every struct derives `#[serde(default)]` so a partial settings file only
//! overrides the keys it names; everything else keeps compiled defaults.

use serde::{Deserialize, Serialize};

/// Top-level settings for the Docket realtime service.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DocketSettings {
    /// HTTP/WebSocket server settings.
    pub server: ServerSettings,
    /// Realtime delivery subsystem settings.
    pub realtime: RealtimeSettings,
    /// Logging settings.
    pub logging: LoggingSettings,
}

/// Server network settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Port to bind (`0` auto-assigns, used by tests).
    pub port: u16,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_message_size: 256 * 1024, // 256 KB
        }
    }
}

/// Realtime delivery subsystem settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RealtimeSettings {
    /// Maximum simultaneous connections per client; the oldest is evicted
    /// when a new connection would exceed this.
    pub per_client_cap: usize,
    /// Dispatch intake queue capacity.
    pub queue_capacity: usize,
    /// Number of dispatch worker tasks.
    pub dispatch_workers: usize,
    /// Per-send timeout in milliseconds on the dispatch path.
    pub send_timeout_ms: u64,
    /// Per-connection outbound channel capacity.
    pub outbound_buffer: usize,
    /// Keepalive scan interval in milliseconds.
    pub scan_interval_ms: u64,
    /// Probe connections idle longer than this (milliseconds).
    pub ping_idle_ms: u64,
    /// Evict connections idle longer than this (milliseconds).
    pub idle_timeout_ms: u64,
    /// Presence record TTL in milliseconds; slightly longer than
    /// `idle_timeout_ms` so crashed instances self-expire.
    pub presence_ttl_ms: u64,
    /// Max undelivered notifications replayed on (re)connect.
    pub replay_limit: usize,
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            per_client_cap: 5,
            queue_capacity: 256,
            dispatch_workers: 4,
            send_timeout_ms: 500,
            outbound_buffer: 64,
            scan_interval_ms: 30_000,
            ping_idle_ms: 60_000,
            idle_timeout_ms: 300_000,
            presence_ttl_ms: 330_000,
            replay_limit: 50,
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level (`trace`..`error`), overridable via `RUST_LOG`.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
