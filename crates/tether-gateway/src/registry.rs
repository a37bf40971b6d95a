//! Registry of live gateway connections.

use std::sync::Arc;

use parking_lot::RwLock;

use tether_proto::DeviceId;

use crate::connection::GatewayConnection;

/// Tracks every live [`GatewayConnection`].
///
/// Writers take the lock exclusively, lookups share it. Lookups scan the
/// list linearly.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<Vec<Arc<GatewayConnection>>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection.
    pub fn register(&self, conn: Arc<GatewayConnection>) {
        self.connections.write().push(conn);
    }

    /// Remove a connection. Returns `false` if it was not registered.
    pub fn unregister(&self, conn: &GatewayConnection) -> bool {
        let mut connections = self.connections.write();
        match connections.iter().position(|c| c.id() == conn.id()) {
            Some(index) => {
                connections.swap_remove(index);
                true
            }
            None => false,
        }
    }

    /// The connection bound to `device`, if any.
    #[must_use]
    pub fn find_by_device(&self, device: DeviceId) -> Option<Arc<GatewayConnection>> {
        self.connections
            .read()
            .iter()
            .find(|c| c.is_bound_to(device))
            .cloned()
    }

    /// Number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    /// Whether no connection is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }
}
