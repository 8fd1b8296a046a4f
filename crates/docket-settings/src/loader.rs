//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`DocketSettings::default()`]
//! 2. If `~/.docket/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `DOCKET_*` environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::DocketSettings;

/// Resolve the path to the settings file (`~/.docket/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".docket").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<DocketSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<DocketSettings> {
    let defaults = serde_json::to_value(DocketSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: DocketSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Each env var has strict parsing rules; invalid values are silently
/// ignored (fall back to file/default).
pub fn apply_env_overrides(settings: &mut DocketSettings) {
    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = read_env_string("DOCKET_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_env("DOCKET_PORT", |r| parse_u64(r, 0, 65_535)) {
        settings.server.port = u16::try_from(v).unwrap_or(settings.server.port);
    }

    // ── Realtime ────────────────────────────────────────────────────
    if let Some(v) = read_env("DOCKET_PER_CLIENT_CAP", |r| parse_u64(r, 1, 1_000)) {
        settings.realtime.per_client_cap = v as usize;
    }
    if let Some(v) = read_env("DOCKET_QUEUE_CAPACITY", |r| parse_u64(r, 1, 1_000_000)) {
        settings.realtime.queue_capacity = v as usize;
    }
    if let Some(v) = read_env("DOCKET_DISPATCH_WORKERS", |r| parse_u64(r, 1, 256)) {
        settings.realtime.dispatch_workers = v as usize;
    }
    if let Some(v) = read_env("DOCKET_SEND_TIMEOUT_MS", |r| parse_u64(r, 10, 60_000)) {
        settings.realtime.send_timeout_ms = v;
    }
    if let Some(v) = read_env("DOCKET_SCAN_INTERVAL_MS", |r| parse_u64(r, 100, 3_600_000)) {
        settings.realtime.scan_interval_ms = v;
    }
    if let Some(v) = read_env("DOCKET_PING_IDLE_MS", |r| parse_u64(r, 100, 3_600_000)) {
        settings.realtime.ping_idle_ms = v;
    }
    if let Some(v) = read_env("DOCKET_IDLE_TIMEOUT_MS", |r| parse_u64(r, 1_000, 86_400_000)) {
        settings.realtime.idle_timeout_ms = v;
    }
    if let Some(v) = read_env("DOCKET_PRESENCE_TTL_MS", |r| parse_u64(r, 1_000, 86_400_000)) {
        settings.realtime.presence_ttl_ms = v;
    }
    if let Some(v) = read_env("DOCKET_REPLAY_LIMIT", |r| parse_u64(r, 0, 10_000)) {
        settings.realtime.replay_limit = v as usize;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = read_env_string("DOCKET_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env("DOCKET_LOG_JSON", parse_bool) {
        settings.logging.json = v;
    }
}

fn read_env<T>(name: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
    std::env::var(name).ok().and_then(|raw| parse(&raw))
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Parse an integer within `[min, max]`; out-of-range or malformed → `None`.
fn parse_u64(raw: &str, min: u64, max: u64) -> Option<u64> {
    raw.trim()
        .parse::<u64>()
        .ok()
        .filter(|v| (min..=max).contains(v))
}

/// Parse a boolean: `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
