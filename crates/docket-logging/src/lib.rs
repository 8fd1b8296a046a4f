//! # docket-logging
//!
//! Structured logging with `tracing` for the Docket portal.
//!
//! One `init_subscriber` call at startup installs an env-filtered `fmt`
//! subscriber (human-readable or JSON lines per settings). `RUST_LOG`
//! always wins over the configured level.

#![deny(unsafe_code)]

use docket_settings::LoggingSettings;
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber.
///
/// Call once at application startup. Subsequent calls are no-ops; tests
/// may call it freely.
pub fn init_subscriber(settings: &LoggingSettings) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.level));

    if settings.json {
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .json();
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .compact();
        let _ = subscriber.try_init();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
