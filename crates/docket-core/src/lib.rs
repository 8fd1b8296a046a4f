//! # docket-core
//!
//! Foundation types for the Docket client-portal realtime service.
//!
//! This crate provides the shared vocabulary that all other Docket crates
//! depend on:
//!
//! - **Branded IDs**: `ClientId`, `ConnectionId`, `UpdateId`, … as newtypes
//!   for type safety, plus `GroupName` for subscription groups
//! - **Updates**: the [`Update`] value type with target, priority and expiry
//! - **Wire frames**: [`ClientFrame`] / [`ServerFrame`] for the connection
//!   protocol
//! - **Errors**: the [`RealtimeError`] taxonomy via `thiserror`
//!
//! [`Update`]: update::Update
//! [`ClientFrame`]: protocol::ClientFrame
//! [`ServerFrame`]: protocol::ServerFrame
//! [`RealtimeError`]: errors::RealtimeError

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod protocol;
pub mod update;

pub use errors::RealtimeError;
pub use ids::{ClientId, ConnectionId, GroupName, InstanceId, NotificationId, SessionId, UpdateId};
pub use protocol::{ClientFrame, ServerFrame};
pub use update::{InvalidTarget, Update, UpdatePriority, UpdateTarget};
