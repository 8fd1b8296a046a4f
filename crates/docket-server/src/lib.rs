//! # docket-server
//!
//! Axum HTTP + `WebSocket` surface for the Docket realtime service.
//!
//! - HTTP endpoints: `/health`, `/metrics`, `/stats`, `POST /notify`
//! - `WebSocket` gateway: token-validated upgrade, per-session loops,
//!   frame dispatch, replay on admission
//! - Graceful shutdown via `tokio::signal` + `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod health;
pub mod metrics;
pub mod routes;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::{ServerConfig, realtime_config};
pub use server::{AppState, DocketServer, ServerError};
pub use shutdown::ShutdownCoordinator;
