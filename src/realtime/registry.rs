/// Live-connection registry with multi-axis fan-out
///
/// Tracks every attached client in one canonical table keyed by
/// (user_id, device_id), with secondary indexes per user, role, apartment,
/// role x apartment, and a global-role axis for connections that carry no
/// apartment scope. Fan-out snapshots its targets under the read lock and
/// writes with no lock held.
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{ConnectionInfo, ConnectionStats, Role};

use super::envelope::Envelope;
use super::sink::{EventSink, Frame, SinkError};

/// Identity of one physical attach; survives into the removal handshake so a
/// stale handle can never evict a newer connection on the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

/// One live connection: metadata snapshot plus the write side of its stream
#[derive(Clone)]
pub struct Connection {
    id: ConnectionId,
    device_id: String,
    role: Role,
    apartment_id: Option<String>,
    connected_at: DateTime<Utc>,
    sink: Arc<dyn EventSink>,
}

impl Connection {
    pub fn new(
        device_id: &str,
        role: Role,
        apartment_id: Option<String>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Connection {
            id: ConnectionId::new(),
            device_id: device_id.to_string(),
            role,
            apartment_id,
            connected_at: Utc::now(),
            sink,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn apartment_id(&self) -> Option<&str> {
        self.apartment_id.as_deref()
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn write(&self, frame: &Frame) -> Result<(), SinkError> {
        self.sink.write(frame)
    }

    pub fn close(&self) {
        self.sink.close()
    }

    fn info(&self, user_id: &str) -> ConnectionInfo {
        ConnectionInfo {
            user_id: user_id.to_string(),
            device_id: self.device_id.clone(),
            role: self.role,
            apartment_id: self.apartment_id.clone(),
            connected_at: self.connected_at,
        }
    }
}

/// Exclusion filters applied to a broadcast's snapshot
#[derive(Debug, Clone, Default)]
pub struct BroadcastOptions {
    pub exclude_user: Option<String>,
    pub exclude_device: Option<String>,
    pub only_role: Option<Role>,
}

impl BroadcastOptions {
    fn allows(&self, key: &ConnKey, connection: &Connection) -> bool {
        if let Some(user) = &self.exclude_user {
            if key.0 == *user {
                return false;
            }
        }
        if let Some(device) = &self.exclude_device {
            if key.1 == *device {
                return false;
            }
        }
        if let Some(role) = self.only_role {
            if connection.role() != role {
                return false;
            }
        }
        true
    }
}

/// A write failure on one sink, reported without aborting the fan-out
#[derive(Debug)]
pub struct DeliveryFailure {
    pub user_id: String,
    pub device_id: String,
    pub error: SinkError,
}

type ConnKey = (String, String);

#[derive(Default)]
struct RegistryIndexes {
    connections: HashMap<ConnKey, Connection>,
    /// user_id -> device ids in attach order
    by_user: HashMap<String, Vec<String>>,
    by_role: HashMap<Role, Vec<ConnKey>>,
    by_apartment: HashMap<String, Vec<ConnKey>>,
    by_role_apartment: HashMap<(Role, String), Vec<ConnKey>>,
    /// Role axis for connections with no apartment scope
    by_global_role: HashMap<Role, Vec<ConnKey>>,
}

fn push_unique(list: &mut Vec<ConnKey>, key: &ConnKey) {
    if !list.contains(key) {
        list.push(key.clone());
    }
}

/// Remove `key` from one index bucket and prune the bucket when it empties.
fn remove_key<K: Eq + std::hash::Hash>(
    map: &mut HashMap<K, Vec<ConnKey>>,
    index: &K,
    key: &ConnKey,
) {
    let now_empty = match map.get_mut(index) {
        Some(list) => {
            list.retain(|k| k != key);
            list.is_empty()
        }
        None => false,
    };
    if now_empty {
        map.remove(index);
    }
}

impl RegistryIndexes {
    fn index(&mut self, user_id: &str, connection: &Connection) {
        let key = (user_id.to_string(), connection.device_id().to_string());

        let devices = self.by_user.entry(user_id.to_string()).or_default();
        if !devices.contains(&key.1) {
            devices.push(key.1.clone());
        }

        push_unique(self.by_role.entry(connection.role()).or_default(), &key);

        match connection.apartment_id() {
            Some(apartment) => {
                push_unique(
                    self.by_apartment.entry(apartment.to_string()).or_default(),
                    &key,
                );
                push_unique(
                    self.by_role_apartment
                        .entry((connection.role(), apartment.to_string()))
                        .or_default(),
                    &key,
                );
            }
            None => push_unique(
                self.by_global_role.entry(connection.role()).or_default(),
                &key,
            ),
        }
    }

    /// Exact reverse of `index`; every bucket touched on insert is cleaned
    /// here and pruned when empty.
    fn unindex(&mut self, user_id: &str, connection: &Connection) {
        let key = (user_id.to_string(), connection.device_id().to_string());

        let user_empty = match self.by_user.get_mut(user_id) {
            Some(devices) => {
                devices.retain(|d| d != connection.device_id());
                devices.is_empty()
            }
            None => false,
        };
        if user_empty {
            self.by_user.remove(user_id);
        }

        remove_key(&mut self.by_role, &connection.role(), &key);

        match connection.apartment_id() {
            Some(apartment) => {
                remove_key(&mut self.by_apartment, &apartment.to_string(), &key);
                remove_key(
                    &mut self.by_role_apartment,
                    &(connection.role(), apartment.to_string()),
                    &key,
                );
            }
            None => remove_key(&mut self.by_global_role, &connection.role(), &key),
        }
    }

    /// Clone a user's connections in attach order
    fn snapshot_user(&self, user_id: &str) -> Vec<(ConnKey, Connection)> {
        let mut targets = Vec::new();
        if let Some(devices) = self.by_user.get(user_id) {
            for device_id in devices {
                let key = (user_id.to_string(), device_id.clone());
                if let Some(connection) = self.connections.get(&key) {
                    targets.push((key, connection.clone()));
                }
            }
        }
        targets
    }

    fn snapshot_keys(&self, keys: &[ConnKey], opts: &BroadcastOptions) -> Vec<(ConnKey, Connection)> {
        keys.iter()
            .filter_map(|key| {
                self.connections
                    .get(key)
                    .map(|connection| (key.clone(), connection.clone()))
            })
            .filter(|(key, connection)| opts.allows(key, connection))
            .collect()
    }

    fn all_keys(&self) -> Vec<ConnKey> {
        let mut keys = Vec::new();
        for (user_id, devices) in &self.by_user {
            for device_id in devices {
                keys.push((user_id.clone(), device_id.clone()));
            }
        }
        keys
    }
}

fn log_delivery_failure(failure: DeliveryFailure) {
    warn!(
        user_id = %failure.user_id,
        device_id = %failure.device_id,
        error = %failure.error,
        "dropping frame for unreachable sink"
    );
}

/// Registry of live client connections
///
/// Thread-safe via a single RwLock over the canonical table and all
/// secondary indexes, so every add/remove updates them atomically.
/// Constructed once at startup and injected; `clear_all` is the reset hook.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<RegistryIndexes>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection under (user_id, device_id).
    ///
    /// A re-attach of the same slot replaces the previous record: its index
    /// entries are reversed and its sink force-closed before the new record
    /// is indexed.
    pub async fn add_client(&self, user_id: &str, connection: Connection) {
        let mut guard = self.inner.write().await;
        let key = (user_id.to_string(), connection.device_id().to_string());

        if let Some(previous) = guard.connections.remove(&key) {
            guard.unindex(user_id, &previous);
            previous.close();
            debug!(
                user_id = %user_id,
                device_id = %connection.device_id(),
                "replaced existing connection on re-attach"
            );
        }

        guard.index(user_id, &connection);
        debug!(
            user_id = %user_id,
            device_id = %connection.device_id(),
            role = %connection.role().as_str(),
            "client connected"
        );
        guard.connections.insert(key, connection);
    }

    /// Remove a connection, matching on its identity.
    ///
    /// Returns false (and leaves the registry untouched) when the slot is
    /// already empty or is owned by a newer attach.
    pub async fn remove_client(
        &self,
        user_id: &str,
        device_id: &str,
        connection: &Connection,
    ) -> bool {
        let mut guard = self.inner.write().await;
        let key = (user_id.to_string(), device_id.to_string());

        let owns_slot = guard
            .connections
            .get(&key)
            .map(|current| current.id() == connection.id())
            .unwrap_or(false);
        if !owns_slot {
            return false;
        }

        if let Some(stored) = guard.connections.remove(&key) {
            guard.unindex(user_id, &stored);
        }
        debug!(user_id = %user_id, device_id = %device_id, "client disconnected");
        true
    }

    /// Push an envelope to every connection of one user, logging failures.
    pub async fn send_to_user(&self, user_id: &str, envelope: &Envelope) -> usize {
        self.send_to_user_with(user_id, envelope, log_delivery_failure)
            .await
    }

    /// Push an envelope to every connection of one user, reporting each sink
    /// failure through `on_error`. Returns the count actually delivered.
    pub async fn send_to_user_with(
        &self,
        user_id: &str,
        envelope: &Envelope,
        mut on_error: impl FnMut(DeliveryFailure),
    ) -> usize {
        let targets = {
            let guard = self.inner.read().await;
            guard.snapshot_user(user_id)
        };
        deliver(&targets, envelope, &mut on_error)
    }

    pub async fn broadcast_all(&self, envelope: &Envelope, opts: &BroadcastOptions) -> usize {
        let targets = {
            let guard = self.inner.read().await;
            let keys = guard.all_keys();
            guard.snapshot_keys(&keys, opts)
        };
        deliver(&targets, envelope, &mut log_delivery_failure)
    }

    pub async fn broadcast_by_role(
        &self,
        role: Role,
        envelope: &Envelope,
        opts: &BroadcastOptions,
    ) -> usize {
        let targets = {
            let guard = self.inner.read().await;
            let keys = guard.by_role.get(&role).cloned().unwrap_or_default();
            guard.snapshot_keys(&keys, opts)
        };
        deliver(&targets, envelope, &mut log_delivery_failure)
    }

    pub async fn broadcast_to_apartment(
        &self,
        apartment_id: &str,
        envelope: &Envelope,
        opts: &BroadcastOptions,
    ) -> usize {
        let targets = {
            let guard = self.inner.read().await;
            let keys = guard
                .by_apartment
                .get(apartment_id)
                .cloned()
                .unwrap_or_default();
            guard.snapshot_keys(&keys, opts)
        };
        deliver(&targets, envelope, &mut log_delivery_failure)
    }

    pub async fn broadcast_by_role_and_apartment(
        &self,
        role: Role,
        apartment_id: &str,
        envelope: &Envelope,
        opts: &BroadcastOptions,
    ) -> usize {
        let targets = {
            let guard = self.inner.read().await;
            let keys = guard
                .by_role_apartment
                .get(&(role, apartment_id.to_string()))
                .cloned()
                .unwrap_or_default();
            guard.snapshot_keys(&keys, opts)
        };
        deliver(&targets, envelope, &mut log_delivery_failure)
    }

    /// Broadcast to connections of a role that carry no apartment scope.
    pub async fn broadcast_to_global_role(
        &self,
        role: Role,
        envelope: &Envelope,
        opts: &BroadcastOptions,
    ) -> usize {
        let targets = {
            let guard = self.inner.read().await;
            let keys = guard.by_global_role.get(&role).cloned().unwrap_or_default();
            guard.snapshot_keys(&keys, opts)
        };
        deliver(&targets, envelope, &mut log_delivery_failure)
    }

    pub async fn is_user_connected(&self, user_id: &str) -> bool {
        let guard = self.inner.read().await;
        guard.by_user.contains_key(user_id)
    }

    /// Number of active connections for a user
    pub async fn connection_count(&self, user_id: &str) -> usize {
        let guard = self.inner.read().await;
        guard.by_user.get(user_id).map(|v| v.len()).unwrap_or(0)
    }

    /// Total number of active connections
    pub async fn total_connections(&self) -> usize {
        let guard = self.inner.read().await;
        guard.connections.len()
    }

    /// Number of distinct connected users
    pub async fn connected_users_count(&self) -> usize {
        let guard = self.inner.read().await;
        guard.by_user.len()
    }

    /// Number of active connections carrying the given role
    pub async fn role_connection_count(&self, role: Role) -> usize {
        let guard = self.inner.read().await;
        guard.by_role.get(&role).map(|v| v.len()).unwrap_or(0)
    }

    pub async fn connection_stats(&self) -> ConnectionStats {
        let guard = self.inner.read().await;
        let by_role = guard
            .by_role
            .iter()
            .map(|(role, keys)| (role.as_str().to_string(), keys.len()))
            .collect();
        let by_apartment = guard
            .by_apartment
            .iter()
            .map(|(apartment, keys)| (apartment.clone(), keys.len()))
            .collect();

        ConnectionStats {
            total_connections: guard.connections.len(),
            connected_users: guard.by_user.len(),
            by_role,
            by_apartment,
        }
    }

    pub async fn all_connections(&self) -> Vec<ConnectionInfo> {
        let guard = self.inner.read().await;
        guard
            .all_keys()
            .into_iter()
            .filter_map(|key| {
                guard
                    .connections
                    .get(&key)
                    .map(|connection| connection.info(&key.0))
            })
            .collect()
    }

    pub async fn user_connections(&self, user_id: &str) -> Vec<ConnectionInfo> {
        let guard = self.inner.read().await;
        guard
            .snapshot_user(user_id)
            .into_iter()
            .map(|(key, connection)| connection.info(&key.0))
            .collect()
    }

    /// Metadata snapshot recorded when the connection was added
    pub async fn connection_metadata(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Option<ConnectionInfo> {
        let guard = self.inner.read().await;
        guard
            .connections
            .get(&(user_id.to_string(), device_id.to_string()))
            .map(|connection| connection.info(user_id))
    }

    /// Force-close every sink and reset all indexes. Returns the number of
    /// connections dropped. This is the shutdown/test-isolation hook.
    pub async fn clear_all(&self) -> usize {
        let mut guard = self.inner.write().await;
        let dropped = guard.connections.len();
        for connection in guard.connections.values() {
            connection.close();
        }
        *guard = RegistryIndexes::default();
        if dropped > 0 {
            debug!(dropped = dropped, "cleared all connections");
        }
        dropped
    }

    /// True when any index bucket is empty or points at a connection that no
    /// longer exists.
    #[cfg(test)]
    pub(crate) async fn index_residue(&self) -> bool {
        let guard = self.inner.read().await;

        let empty_bucket = guard.by_user.values().any(|v| v.is_empty())
            || guard.by_role.values().any(|v| v.is_empty())
            || guard.by_apartment.values().any(|v| v.is_empty())
            || guard.by_role_apartment.values().any(|v| v.is_empty())
            || guard.by_global_role.values().any(|v| v.is_empty());

        let dangling = guard
            .by_user
            .iter()
            .any(|(user, devices)| {
                devices
                    .iter()
                    .any(|d| !guard.connections.contains_key(&(user.clone(), d.clone())))
            })
            || guard
                .by_role
                .values()
                .flatten()
                .any(|k| !guard.connections.contains_key(k))
            || guard
                .by_apartment
                .values()
                .flatten()
                .any(|k| !guard.connections.contains_key(k))
            || guard
                .by_role_apartment
                .values()
                .flatten()
                .any(|k| !guard.connections.contains_key(k))
            || guard
                .by_global_role
                .values()
                .flatten()
                .any(|k| !guard.connections.contains_key(k));

        empty_bucket || dangling
    }
}

/// Write one envelope to a snapshot of targets with no lock held.
fn deliver(
    targets: &[(ConnKey, Connection)],
    envelope: &Envelope,
    on_error: &mut dyn FnMut(DeliveryFailure),
) -> usize {
    let frame = Frame::Event(envelope.clone());
    let mut delivered = 0;

    for ((user_id, device_id), connection) in targets {
        match connection.write(&frame) {
            Ok(()) => delivered += 1,
            Err(error) => on_error(DeliveryFailure {
                user_id: user_id.clone(),
                device_id: device_id.clone(),
                error,
            }),
        }
    }

    delivered
}
