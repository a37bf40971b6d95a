//! Kernel interface abstraction.
//!
//! A [`KernelBackend`] is owned by exactly one task, the reconciler, which is
//! the only code allowed to mutate the interface. Everything else reads the
//! peer table through a [`PeerTable`] handle obtained from the backend.

use std::future::Future;

use ipnet::IpNet;

use crate::error::Result;
use crate::keys::PublicKey;
use crate::types::{InterfaceConfig, PeerStatus};

/// Read-only view of the kernel peer table.
pub trait PeerTable: Send + Sync {
    /// Snapshot of every peer currently configured on the interface.
    fn peers(&self) -> Result<Vec<PeerStatus>>;
}

/// Mutating operations on one kernel `WireGuard` interface.
pub trait KernelBackend: Send + 'static {
    /// Query handle type returned by [`KernelBackend::peer_table`].
    type Table: PeerTable + Clone + 'static;

    /// A read-only handle that stays valid while the backend is in use.
    fn peer_table(&self) -> Self::Table;

    /// Create the interface if absent, assign the local address, bring it up,
    /// and install the private key and listen port.
    fn setup(&mut self, config: &InterfaceConfig) -> impl Future<Output = Result<()>> + Send;

    /// Route `dst` through the interface, replacing any existing route.
    fn add_route(&mut self, dst: IpNet) -> impl Future<Output = Result<()>> + Send;

    /// Delete the route for `dst` if it goes through this interface.
    fn remove_route(&mut self, dst: IpNet) -> impl Future<Output = Result<()>> + Send;

    /// Add a peer or replace its allowed IPs.
    fn upsert_peer(
        &mut self,
        key: &PublicKey,
        allowed_ips: &[IpNet],
    ) -> impl Future<Output = Result<()>> + Send;

    /// Remove a peer. Removing an unknown peer is not an error.
    fn remove_peer(&mut self, key: &PublicKey) -> impl Future<Output = Result<()>> + Send;

    /// Delete the interface.
    fn teardown(&mut self) -> impl Future<Output = Result<()>> + Send;
}
