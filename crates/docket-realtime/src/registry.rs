//! The authoritative in-process map of live connections.
//!
//! All registry state sits behind one coarse `parking_lot::RwLock`; mutation
//! rate is low relative to connection count, so correctness wins over
//! fine-grained locking. Reads (`resolve_targets`, `stats`) take the read
//! half so the broadcast path does not block on admissions.
//!
//! Lifecycle transitions on the affected handles happen after the lock is
//! released; the lock only ever guards the maps.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use metrics::{counter, gauge};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use docket_core::{ClientId, ConnectionId, GroupName, RealtimeError};

use crate::connection::ClientConnection;

/// Why a connection was removed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoveReason {
    /// The client closed the transport (or it failed abruptly).
    Disconnect,
    /// Keepalive timeout.
    Timeout,
    /// Evicted to make room under the per-client cap.
    Capacity,
    /// A dispatch send failed; the connection is presumed dead.
    SendFailure,
    /// Server shutdown.
    Shutdown,
}

impl RemoveReason {
    /// Stable label for logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnect => "disconnect",
            Self::Timeout => "timeout",
            Self::Capacity => "capacity",
            Self::SendFailure => "send_failure",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for RemoveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of admitting a connection.
#[derive(Clone, Debug)]
pub struct AdmitOutcome {
    /// ID of the admitted connection.
    pub connection_id: ConnectionId,
    /// The connection evicted to make room, if the cap was reached.
    pub evicted: Option<ConnectionId>,
}

/// Read-only registry snapshot for observability.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    /// All live connections.
    pub total_connections: usize,
    /// Clients with at least one connection.
    pub unique_clients: usize,
    /// Member count per subscription group.
    pub per_group_counts: BTreeMap<String, usize>,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnectionId, Arc<ClientConnection>>,
    /// Per-client connection IDs in admission order; front is oldest.
    by_client: HashMap<ClientId, VecDeque<ConnectionId>>,
    groups: HashMap<GroupName, HashSet<ConnectionId>>,
}

impl Inner {
    /// Detach a connection from every map. Returns the handle if it was
    /// registered.
    fn detach(&mut self, connection_id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        let conn = self.connections.remove(connection_id)?;

        if let Some(ids) = self.by_client.get_mut(&conn.client_id) {
            ids.retain(|id| id != connection_id);
            if ids.is_empty() {
                let _ = self.by_client.remove(&conn.client_id);
            }
        }

        for group in conn.groups() {
            if let Some(members) = self.groups.get_mut(&group) {
                let _ = members.remove(connection_id);
                if members.is_empty() {
                    let _ = self.groups.remove(&group);
                }
            }
            let _ = conn.remove_group(&group);
        }

        Some(conn)
    }
}

/// Tracks all live connections, indexed by connection ID, owning client ID,
/// and subscription-group name. Enforces the per-client connection cap by
/// evicting the oldest connection rather than rejecting admissions.
pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
    per_client_cap: usize,
}

impl ConnectionRegistry {
    /// Create a registry with the given per-client connection cap.
    pub fn new(per_client_cap: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            per_client_cap: per_client_cap.max(1),
        }
    }

    /// The configured per-client cap.
    pub fn per_client_cap(&self) -> usize {
        self.per_client_cap
    }

    /// Admit a connection.
    ///
    /// If the owning client is at the cap, the oldest of its connections is
    /// evicted first — admission itself never fails for capacity reasons.
    /// The connection joins its client's default group.
    pub fn admit(&self, conn: Arc<ClientConnection>) -> AdmitOutcome {
        let connection_id = conn.id.clone();
        let client_id = conn.client_id.clone();
        let default_group = GroupName::for_client(&client_id);

        let evicted = {
            let mut inner = self.inner.write();

            let evicted = if inner
                .by_client
                .get(&client_id)
                .is_some_and(|ids| ids.len() >= self.per_client_cap)
            {
                let oldest = inner
                    .by_client
                    .get(&client_id)
                    .and_then(|ids| ids.front().cloned());
                oldest.and_then(|id| inner.detach(&id))
            } else {
                None
            };

            let _ = inner.connections.insert(connection_id.clone(), conn.clone());
            inner
                .by_client
                .entry(client_id.clone())
                .or_default()
                .push_back(connection_id.clone());
            let _ = inner
                .groups
                .entry(default_group.clone())
                .or_default()
                .insert(connection_id.clone());
            evicted
        };
        conn.add_group(default_group);

        if let Some(old) = &evicted {
            let err = RealtimeError::CapacityExceeded {
                client_id: client_id.clone(),
                cap: self.per_client_cap,
            };
            debug!(%err, evicted = %old.id, "evicting oldest connection to admit a new one");
            if !old.begin_drain() {
                let _ = old.close();
            }
            counter!("ws_evictions_total", "reason" => RemoveReason::Capacity.as_str())
                .increment(1);
        }

        info!(
            connection_id = %connection_id,
            client_id = %client_id,
            remote_addr = conn.meta.remote_addr.as_deref().unwrap_or("-"),
            "connection admitted"
        );
        counter!("ws_connections_total").increment(1);
        gauge!("ws_connections_active").increment(1.0);
        if evicted.is_some() {
            gauge!("ws_connections_active").decrement(1.0);
        }

        AdmitOutcome {
            connection_id,
            evicted: evicted.map(|c| c.id.clone()),
        }
    }

    /// Remove a connection. Idempotent: removing an unknown or
    /// already-removed ID is a no-op.
    ///
    /// Returns the handle when this call actually removed it.
    pub fn remove(
        &self,
        connection_id: &ConnectionId,
        reason: RemoveReason,
    ) -> Option<Arc<ClientConnection>> {
        let conn = {
            let mut inner = self.inner.write();
            inner.detach(connection_id)
        };

        let Some(conn) = conn else {
            debug!(connection_id = %connection_id, reason = %reason, "remove on unknown connection");
            return None;
        };

        match reason {
            RemoveReason::Disconnect => {
                let _ = conn.close();
            }
            _ => {
                if !conn.begin_drain() {
                    let _ = conn.close();
                }
            }
        }

        info!(
            connection_id = %connection_id,
            client_id = %conn.client_id,
            reason = %reason,
            "connection removed"
        );
        counter!("ws_disconnections_total").increment(1);
        gauge!("ws_connections_active").decrement(1.0);
        if reason != RemoveReason::Disconnect {
            counter!("ws_evictions_total", "reason" => reason.as_str()).increment(1);
        }

        Some(conn)
    }

    /// Subscribe a connection to a group.
    ///
    /// Returns `Ok(true)` if the membership was newly added. Fails with
    /// [`RealtimeError::UnknownConnection`] if the connection is gone — a
    /// legitimate race with disconnect, not worth more than a debug log.
    pub fn subscribe(
        &self,
        connection_id: &ConnectionId,
        group: GroupName,
    ) -> Result<bool, RealtimeError> {
        let mut inner = self.inner.write();
        let Some(conn) = inner.connections.get(connection_id).cloned() else {
            return Err(RealtimeError::UnknownConnection(connection_id.clone()));
        };
        let added = inner
            .groups
            .entry(group.clone())
            .or_default()
            .insert(connection_id.clone());
        drop(inner);
        conn.add_group(group);
        Ok(added)
    }

    /// Unsubscribe a connection from a group.
    ///
    /// Returns `Ok(true)` if a membership was removed.
    pub fn unsubscribe(
        &self,
        connection_id: &ConnectionId,
        group: &GroupName,
    ) -> Result<bool, RealtimeError> {
        let mut inner = self.inner.write();
        let Some(conn) = inner.connections.get(connection_id).cloned() else {
            return Err(RealtimeError::UnknownConnection(connection_id.clone()));
        };
        let removed = inner
            .groups
            .get_mut(group)
            .is_some_and(|members| members.remove(connection_id));
        if removed && inner.groups.get(group).is_some_and(HashSet::is_empty) {
            let _ = inner.groups.remove(group);
        }
        drop(inner);
        let _ = conn.remove_group(group);
        Ok(removed)
    }

    /// Resolve an update target to the union of the client's connections
    /// and the group's members, in `Connected` state only.
    ///
    /// An empty result means "no local delivery" — the target may well be
    /// connected to a different instance.
    pub fn resolve_targets(
        &self,
        client_id: Option<&ClientId>,
        group: Option<&GroupName>,
    ) -> Vec<Arc<ClientConnection>> {
        let inner = self.inner.read();
        let mut seen: HashSet<ConnectionId> = HashSet::new();
        let mut resolved = Vec::new();

        let mut collect = |ids: &mut dyn Iterator<Item = &ConnectionId>| {
            for id in ids {
                if !seen.insert(id.clone()) {
                    continue;
                }
                if let Some(conn) = inner.connections.get(id) {
                    if conn.is_connected() {
                        resolved.push(conn.clone());
                    }
                }
            }
        };

        if let Some(ids) = client_id.and_then(|c| inner.by_client.get(c)) {
            collect(&mut ids.iter());
        }
        if let Some(members) = group.and_then(|g| inner.groups.get(g)) {
            collect(&mut members.iter());
        }

        resolved
    }

    /// Look up a single connection.
    pub fn get(&self, connection_id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        self.inner.read().connections.get(connection_id).cloned()
    }

    /// Snapshot of every live connection (keepalive scan input).
    pub fn snapshot(&self) -> Vec<Arc<ClientConnection>> {
        self.inner.read().connections.values().cloned().collect()
    }

    /// Number of connections currently held by a client.
    pub fn client_connection_count(&self, client_id: &ClientId) -> usize {
        self.inner
            .read()
            .by_client
            .get(client_id)
            .map_or(0, VecDeque::len)
    }

    /// Read-only counters for observability.
    pub fn stats(&self) -> RegistryStats {
        let inner = self.inner.read();
        RegistryStats {
            total_connections: inner.connections.len(),
            unique_clients: inner.by_client.len(),
            per_group_counts: inner
                .groups
                .iter()
                .map(|(name, members)| (name.to_string(), members.len()))
                .collect(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionMeta, ConnectionState, OutboundMessage};
    use docket_core::SessionId;
    use tokio::sync::mpsc;

    fn make_conn(client: &str) -> (Arc<ClientConnection>, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(32);
        let conn = ClientConnection::new(
            ClientId::from(client),
            SessionId::from("sess"),
            tx,
            ConnectionMeta::default(),
        );
        let _ = conn.mark_connected();
        (Arc::new(conn), rx)
    }

    fn admit(registry: &ConnectionRegistry, client: &str) -> Arc<ClientConnection> {
        let (conn, rx) = make_conn(client);
        // Keep the receiver alive for the connection's lifetime in tests.
        std::mem::forget(rx);
        let _ = registry.admit(conn.clone());
        conn
    }

    #[test]
    fn admit_registers_connection_and_default_group() {
        let registry = ConnectionRegistry::new(5);
        let conn = admit(&registry, "42");

        assert_eq!(registry.client_connection_count(&ClientId::from("42")), 1);
        let stats = registry.stats();
        assert_eq!(stats.total_connections, 1);
        assert_eq!(stats.unique_clients, 1);
        assert_eq!(stats.per_group_counts.get("client:42"), Some(&1));
        assert!(conn.groups().contains(&GroupName::from("client:42")));
    }

    #[test]
    fn admit_over_cap_evicts_exactly_the_oldest() {
        let registry = ConnectionRegistry::new(5);
        let first = admit(&registry, "42");
        for _ in 0..4 {
            let _ = admit(&registry, "42");
        }
        assert_eq!(registry.client_connection_count(&ClientId::from("42")), 5);

        // Sixth admission evicts the first connection.
        let (sixth, _rx) = make_conn("42");
        let outcome = registry.admit(sixth);
        assert_eq!(outcome.evicted, Some(first.id.clone()));
        assert_eq!(registry.client_connection_count(&ClientId::from("42")), 5);
        assert_eq!(first.state(), ConnectionState::Draining);
        assert!(registry.get(&first.id).is_none());
    }

    #[test]
    fn cap_scenario_six_admits_one_eviction() {
        let registry = ConnectionRegistry::new(5);
        let mut evictions = 0;
        for _ in 0..6 {
            let (conn, rx) = make_conn("42");
            std::mem::forget(rx);
            if registry.admit(conn).evicted.is_some() {
                evictions += 1;
            }
        }
        assert_eq!(evictions, 1);
        assert_eq!(registry.client_connection_count(&ClientId::from("42")), 5);
    }

    #[test]
    fn caps_are_per_client() {
        let registry = ConnectionRegistry::new(2);
        let _ = admit(&registry, "a");
        let _ = admit(&registry, "a");
        let _ = admit(&registry, "b");
        // Client b is under its own cap; nothing evicted.
        assert_eq!(registry.stats().total_connections, 3);
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = ConnectionRegistry::new(5);
        let conn = admit(&registry, "42");

        assert!(registry.remove(&conn.id, RemoveReason::Disconnect).is_some());
        assert!(registry.remove(&conn.id, RemoveReason::Disconnect).is_none());
        assert_eq!(registry.stats().total_connections, 0);
    }

    #[test]
    fn remove_scrubs_groups_and_client_entry() {
        let registry = ConnectionRegistry::new(5);
        let conn = admit(&registry, "42");
        let _ = registry
            .subscribe(&conn.id, GroupName::from("case:7"))
            .unwrap();

        let _ = registry.remove(&conn.id, RemoveReason::Disconnect);
        let stats = registry.stats();
        assert_eq!(stats.unique_clients, 0);
        assert!(stats.per_group_counts.is_empty(), "empty groups are deleted");
    }

    #[test]
    fn remove_on_disconnect_closes_handle() {
        let registry = ConnectionRegistry::new(5);
        let conn = admit(&registry, "42");
        let _ = registry.remove(&conn.id, RemoveReason::Disconnect);
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn remove_on_timeout_drains_handle() {
        let registry = ConnectionRegistry::new(5);
        let conn = admit(&registry, "42");
        let _ = registry.remove(&conn.id, RemoveReason::Timeout);
        assert_eq!(conn.state(), ConnectionState::Draining);
        assert!(conn.cancel_token().is_cancelled());
    }

    #[test]
    fn subscribe_unknown_connection_errors() {
        let registry = ConnectionRegistry::new(5);
        let result = registry.subscribe(&ConnectionId::from("ghost"), GroupName::from("g"));
        assert!(matches!(
            result,
            Err(RealtimeError::UnknownConnection(id)) if id.as_str() == "ghost"
        ));
    }

    #[test]
    fn subscribe_twice_reports_no_change() {
        let registry = ConnectionRegistry::new(5);
        let conn = admit(&registry, "42");
        assert!(registry
            .subscribe(&conn.id, GroupName::from("case:7"))
            .unwrap());
        assert!(!registry
            .subscribe(&conn.id, GroupName::from("case:7"))
            .unwrap());
    }

    #[test]
    fn unsubscribe_removes_membership() {
        let registry = ConnectionRegistry::new(5);
        let conn = admit(&registry, "42");
        let _ = registry
            .subscribe(&conn.id, GroupName::from("case:7"))
            .unwrap();
        assert!(registry
            .unsubscribe(&conn.id, &GroupName::from("case:7"))
            .unwrap());
        assert!(!registry
            .unsubscribe(&conn.id, &GroupName::from("case:7"))
            .unwrap());
        assert!(registry.stats().per_group_counts.get("case:7").is_none());
    }

    #[test]
    fn resolve_by_client() {
        let registry = ConnectionRegistry::new(5);
        let c1 = admit(&registry, "42");
        let c2 = admit(&registry, "42");
        let _other = admit(&registry, "other");

        let resolved = registry.resolve_targets(Some(&ClientId::from("42")), None);
        let ids: HashSet<_> = resolved.iter().map(|c| c.id.clone()).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&c1.id) && ids.contains(&c2.id));
    }

    #[test]
    fn resolve_by_group() {
        let registry = ConnectionRegistry::new(5);
        let c1 = admit(&registry, "a");
        let _c2 = admit(&registry, "b");
        let _ = registry
            .subscribe(&c1.id, GroupName::from("case:7"))
            .unwrap();

        let resolved = registry.resolve_targets(None, Some(&GroupName::from("case:7")));
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].id, c1.id);
    }

    #[test]
    fn resolve_union_deduplicates() {
        let registry = ConnectionRegistry::new(5);
        let conn = admit(&registry, "42");
        let _ = registry
            .subscribe(&conn.id, GroupName::from("case:7"))
            .unwrap();

        // The connection matches both the client and the group.
        let resolved = registry.resolve_targets(
            Some(&ClientId::from("42")),
            Some(&GroupName::from("case:7")),
        );
        assert_eq!(resolved.len(), 1);
    }

    #[test]
    fn resolve_empty_is_not_an_error() {
        let registry = ConnectionRegistry::new(5);
        let resolved = registry.resolve_targets(
            Some(&ClientId::from("nobody")),
            Some(&GroupName::from("no-group")),
        );
        assert!(resolved.is_empty());
    }

    #[test]
    fn resolve_excludes_non_connected_states() {
        let registry = ConnectionRegistry::new(5);
        let conn = admit(&registry, "42");
        let _ = conn.begin_drain();

        let resolved = registry.resolve_targets(Some(&ClientId::from("42")), None);
        assert!(
            resolved.is_empty(),
            "draining connections must not resolve"
        );
    }

    #[test]
    fn resolve_excludes_connecting_handshake() {
        let registry = ConnectionRegistry::new(5);
        let (tx, _rx) = mpsc::channel(8);
        let conn = Arc::new(ClientConnection::new(
            ClientId::from("42"),
            SessionId::from("s"),
            tx,
            ConnectionMeta::default(),
        ));
        // Admitted before the handshake confirmation — unusual but possible.
        let _ = registry.admit(conn);
        assert!(registry
            .resolve_targets(Some(&ClientId::from("42")), None)
            .is_empty());
    }

    #[test]
    fn stats_counts_groups() {
        let registry = ConnectionRegistry::new(5);
        let c1 = admit(&registry, "a");
        let c2 = admit(&registry, "b");
        let _ = registry.subscribe(&c1.id, GroupName::from("case:7")).unwrap();
        let _ = registry.subscribe(&c2.id, GroupName::from("case:7")).unwrap();

        let stats = registry.stats();
        assert_eq!(stats.total_connections, 2);
        assert_eq!(stats.unique_clients, 2);
        assert_eq!(stats.per_group_counts.get("case:7"), Some(&2));
    }

    #[test]
    fn stats_serialize_camel_case() {
        let registry = ConnectionRegistry::new(5);
        let v = serde_json::to_value(registry.stats()).unwrap();
        assert!(v.get("totalConnections").is_some());
        assert!(v.get("uniqueClients").is_some());
        assert!(v.get("perGroupCounts").is_some());
    }

    #[test]
    fn zero_cap_is_clamped_to_one() {
        let registry = ConnectionRegistry::new(0);
        assert_eq!(registry.per_client_cap(), 1);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// No sequence of admissions can push a client past the cap.
            #[test]
            fn cap_never_exceeded(clients in proptest::collection::vec(0u8..4, 1..40), cap in 1usize..4) {
                let registry = ConnectionRegistry::new(cap);
                for client in clients {
                    let (tx, rx) = mpsc::channel(4);
                    std::mem::forget(rx);
                    let conn = ClientConnection::new(
                        ClientId::from(format!("client_{client}")),
                        SessionId::from("s"),
                        tx,
                        ConnectionMeta::default(),
                    );
                    let _ = conn.mark_connected();
                    let _ = registry.admit(Arc::new(conn));
                    for i in 0u8..4 {
                        let count = registry.client_connection_count(&ClientId::from(format!("client_{i}")));
                        prop_assert!(count <= cap);
                    }
                }
            }
        }
    }
}
