//! Core types shared by the kernel backends and the reconciler.

use std::net::{IpAddr, SocketAddr};

use ipnet::IpNet;

use tether_proto::Device;

use crate::error::Result;
use crate::keys::{PrivateKey, PublicKey};

/// The single-host network covering `ip` (`/32` or `/128`).
#[must_use]
pub fn host_network(ip: IpAddr) -> IpNet {
    IpNet::from(ip)
}

/// Local interface settings applied once at startup.
#[derive(Debug, Clone)]
pub struct InterfaceConfig {
    /// Interface name, e.g. `pp0`.
    pub name: String,
    /// Our own overlay address, assigned as a single-host network.
    pub address: IpAddr,
    /// UDP listen port.
    pub listen_port: u16,
    /// Interface private key.
    pub private_key: PrivateKey,
}

impl InterfaceConfig {
    /// Create an interface configuration.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        address: IpAddr,
        listen_port: u16,
        private_key: PrivateKey,
    ) -> Self {
        Self {
            name: name.into(),
            address,
            listen_port,
            private_key,
        }
    }
}

/// A peer as currently seen by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    /// Peer public key.
    pub public_key: PublicKey,
    /// Last endpoint the kernel observed for this peer.
    pub endpoint: Option<SocketAddr>,
    /// Networks routed to this peer.
    pub allowed_ips: Vec<IpNet>,
}

impl PeerStatus {
    /// Whether one of the peer's allowed networks contains `ip`.
    #[must_use]
    pub fn routes(&self, ip: IpAddr) -> bool {
        let host = host_network(ip);
        self.allowed_ips.iter().any(|net| net.contains(&host))
    }
}

/// A pending change to the kernel peer table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerEvent {
    /// Peer public key.
    pub public_key: PublicKey,
    /// Peer overlay address.
    pub ip: IpAddr,
    /// Remove instead of add.
    pub remove: bool,
}

impl PeerEvent {
    /// Add or replace a peer.
    #[must_use]
    pub const fn add(public_key: PublicKey, ip: IpAddr) -> Self {
        Self {
            public_key,
            ip,
            remove: false,
        }
    }

    /// Remove a peer.
    #[must_use]
    pub const fn remove(public_key: PublicKey, ip: IpAddr) -> Self {
        Self {
            public_key,
            ip,
            remove: true,
        }
    }

    /// Build an add event from a device record.
    ///
    /// # Errors
    ///
    /// Returns an error if the device's key is not a valid base64 key.
    pub fn for_device(device: &Device) -> Result<Self> {
        Ok(Self::add(device.public_key.parse()?, device.ip))
    }

    /// The route and allowed IP installed for this peer.
    #[must_use]
    pub fn allowed_ip(&self) -> IpNet {
        host_network(self.ip)
    }
}
