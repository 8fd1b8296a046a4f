//! WebSocket gateway: upgrade handling, per-session loops, frame dispatch.

pub mod handler;
pub mod session;
