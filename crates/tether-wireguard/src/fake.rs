//! In-memory kernel backend for tests.

use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use ipnet::IpNet;
use parking_lot::Mutex;

use crate::backend::{KernelBackend, PeerTable};
use crate::error::{Result, WireGuardError};
use crate::keys::PublicKey;
use crate::types::{InterfaceConfig, PeerStatus, host_network};

#[derive(Debug, Default)]
struct FakeState {
    name: Option<String>,
    address: Option<IpNet>,
    listen_port: Option<u16>,
    public_key: Option<PublicKey>,
    peers: HashMap<PublicKey, PeerStatus>,
    routes: BTreeSet<IpNet>,
    upserts: usize,
    fail_setup: bool,
    torn_down: bool,
}

/// A fake kernel interface.
///
/// Clones share state, so a test can keep one clone for inspection while the
/// reconciler owns another.
#[derive(Debug, Clone, Default)]
pub struct FakeKernel {
    state: Arc<Mutex<FakeState>>,
}

impl FakeKernel {
    /// Creates an empty fake interface.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next [`KernelBackend::setup`] call fail.
    #[must_use]
    pub fn failing_setup(self) -> Self {
        self.state.lock().fail_setup = true;
        self
    }

    /// Simulates a handshake from `key` arriving from `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer is not configured.
    pub fn simulate_handshake(&self, key: &PublicKey, endpoint: SocketAddr) -> Result<()> {
        let mut state = self.state.lock();
        let peer = state
            .peers
            .get_mut(key)
            .ok_or_else(|| WireGuardError::Interface(format!("peer {key} not found")))?;
        peer.endpoint = Some(endpoint);
        Ok(())
    }

    /// Whether the interface is currently up.
    #[must_use]
    pub fn is_up(&self) -> bool {
        let state = self.state.lock();
        state.name.is_some() && !state.torn_down
    }

    /// Whether [`KernelBackend::teardown`] ran.
    #[must_use]
    pub fn is_torn_down(&self) -> bool {
        self.state.lock().torn_down
    }

    /// The address assigned to the interface.
    #[must_use]
    pub fn address(&self) -> Option<IpNet> {
        self.state.lock().address
    }

    /// The configured listen port.
    #[must_use]
    pub fn listen_port(&self) -> Option<u16> {
        self.state.lock().listen_port
    }

    /// Public key derived from the installed private key.
    #[must_use]
    pub fn public_key(&self) -> Option<PublicKey> {
        self.state.lock().public_key
    }

    /// A configured peer.
    #[must_use]
    pub fn peer(&self, key: &PublicKey) -> Option<PeerStatus> {
        self.state.lock().peers.get(key).cloned()
    }

    /// Number of configured peers.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.state.lock().peers.len()
    }

    /// Number of [`KernelBackend::upsert_peer`] calls so far.
    #[must_use]
    pub fn upsert_count(&self) -> usize {
        self.state.lock().upserts
    }

    /// Whether a route for `ip` points at the interface.
    #[must_use]
    pub fn has_route(&self, ip: IpAddr) -> bool {
        self.state.lock().routes.contains(&host_network(ip))
    }
}

/// Read-only view of a [`FakeKernel`]'s peers.
#[derive(Debug, Clone)]
pub struct FakePeerTable {
    state: Arc<Mutex<FakeState>>,
}

impl PeerTable for FakePeerTable {
    fn peers(&self) -> Result<Vec<PeerStatus>> {
        let mut peers: Vec<_> = self.state.lock().peers.values().cloned().collect();
        peers.sort_by(|a, b| a.public_key.cmp(&b.public_key));
        Ok(peers)
    }
}

impl KernelBackend for FakeKernel {
    type Table = FakePeerTable;

    fn peer_table(&self) -> Self::Table {
        FakePeerTable {
            state: Arc::clone(&self.state),
        }
    }

    async fn setup(&mut self, config: &InterfaceConfig) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_setup {
            return Err(WireGuardError::Interface(format!(
                "cannot create {}: operation not permitted",
                config.name
            )));
        }
        state.name = Some(config.name.clone());
        state.address = Some(host_network(config.address));
        state.listen_port = Some(config.listen_port);
        state.public_key = Some(config.private_key.public_key());
        state.torn_down = false;
        Ok(())
    }

    async fn add_route(&mut self, dst: IpNet) -> Result<()> {
        self.state.lock().routes.insert(dst);
        Ok(())
    }

    async fn remove_route(&mut self, dst: IpNet) -> Result<()> {
        self.state.lock().routes.remove(&dst);
        Ok(())
    }

    async fn upsert_peer(&mut self, key: &PublicKey, allowed_ips: &[IpNet]) -> Result<()> {
        let mut state = self.state.lock();
        state.upserts += 1;
        let peer = state.peers.entry(*key).or_insert_with(|| PeerStatus {
            public_key: *key,
            endpoint: None,
            allowed_ips: Vec::new(),
        });
        peer.allowed_ips = allowed_ips.to_vec();
        Ok(())
    }

    async fn remove_peer(&mut self, key: &PublicKey) -> Result<()> {
        self.state.lock().peers.remove(key);
        Ok(())
    }

    async fn teardown(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.peers.clear();
        state.routes.clear();
        state.torn_down = true;
        Ok(())
    }
}
