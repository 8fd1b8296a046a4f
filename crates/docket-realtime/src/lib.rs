//! # docket-realtime
//!
//! The realtime update delivery subsystem of the Docket client portal.
//!
//! - [`ClientConnection`]: one live connection to one client device, owning
//!   outbound-send serialization and its lifecycle state machine
//! - [`ConnectionRegistry`]: authoritative in-process map of live
//!   connections, their owners and subscription groups, with per-client caps
//! - [`UpdateDispatcher`]: bounded intake queue + worker pool fanning
//!   updates out to resolved connections
//! - [`KeepaliveMonitor`]: periodic liveness scan, probing idle connections
//!   and evicting dead ones
//! - [`CrossInstanceCoordinator`]: presence records and update broadcast
//!   through a shared coordination store so all instances act as one registry
//! - [`DeliveryAckTracker`]: idempotent acknowledgement reconciliation
//!   feeding delivery status back to the notification store
//! - [`RealtimeService`]: the composition facade the server and binary use
//!
//! [`ClientConnection`]: connection::ClientConnection
//! [`ConnectionRegistry`]: registry::ConnectionRegistry
//! [`UpdateDispatcher`]: dispatcher::UpdateDispatcher
//! [`KeepaliveMonitor`]: keepalive::KeepaliveMonitor
//! [`CrossInstanceCoordinator`]: coordinator::CrossInstanceCoordinator
//! [`DeliveryAckTracker`]: acks::DeliveryAckTracker
//! [`RealtimeService`]: service::RealtimeService

#![deny(unsafe_code)]

pub mod acks;
pub mod collaborators;
pub mod connection;
pub mod coordinator;
pub mod dispatcher;
pub mod keepalive;
pub mod registry;
pub mod service;
pub mod store;

pub use acks::DeliveryAckTracker;
pub use collaborators::{
    AuthError, CollaboratorError, DevValidator, Identity, MemoryNotificationStore,
    NotificationStatus, NotificationStore, PendingNotification, SessionValidator, StaticValidator,
};
pub use connection::{ClientConnection, ConnectionMeta, ConnectionState, OutboundMessage};
pub use coordinator::CrossInstanceCoordinator;
pub use dispatcher::{DispatcherConfig, DispatcherStats, UpdateDispatcher};
pub use keepalive::{KeepaliveConfig, KeepaliveMonitor, ScanOutcome};
pub use registry::{AdmitOutcome, ConnectionRegistry, RegistryStats, RemoveReason};
pub use service::{RealtimeConfig, RealtimeService, ServiceStats};
pub use store::{CoordinationStore, Envelope, MemoryCoordinationStore, StoreError};
