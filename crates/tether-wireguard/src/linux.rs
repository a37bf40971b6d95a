//! Linux kernel `WireGuard` backend using the netlink API.
//!
//! Wraps `defguard_wireguard_rs` for interface and peer configuration and
//! shells out to `ip` for link state and per-peer routes.

use std::str::FromStr;

use defguard_wireguard_rs::host::Peer as DgPeer;
use defguard_wireguard_rs::key::Key as DgKey;
use defguard_wireguard_rs::net::IpAddrMask;
use defguard_wireguard_rs::{InterfaceConfiguration, Kernel, WGApi, WireguardInterfaceApi};
use ipnet::IpNet;
use tokio::process::Command;
use tracing::{debug, info};

use crate::backend::{KernelBackend, PeerTable};
use crate::error::{Result, WireGuardError};
use crate::keys::PublicKey;
use crate::types::{InterfaceConfig, PeerStatus, host_network};

fn api(ifname: &str) -> Result<WGApi<Kernel>> {
    WGApi::<Kernel>::new(ifname.to_string())
        .map_err(|e| WireGuardError::Interface(format!("WGApi::new: {e}")))
}

fn to_ip_addr_mask(net: &IpNet) -> Result<IpAddrMask> {
    IpAddrMask::from_str(&net.to_string())
        .map_err(|e| WireGuardError::Interface(format!("{net}: {e}")))
}

fn to_defguard_key(key: &PublicKey) -> Result<DgKey> {
    DgKey::try_from(key.as_bytes().as_slice())
        .map_err(|e| WireGuardError::Interface(format!("defguard key conversion: {e}")))
}

/// Read-only handle on the interface's peer table.
#[derive(Debug, Clone)]
pub struct LinuxPeerTable {
    ifname: String,
}

impl PeerTable for LinuxPeerTable {
    fn peers(&self) -> Result<Vec<PeerStatus>> {
        let host = api(&self.ifname)?
            .read_interface_data()
            .map_err(|e| WireGuardError::Interface(format!("read_interface_data: {e}")))?;

        Ok(host
            .peers
            .values()
            .map(|peer| PeerStatus {
                public_key: PublicKey::from_bytes_array(peer.public_key.as_array()),
                endpoint: peer.endpoint,
                allowed_ips: peer
                    .allowed_ips
                    .iter()
                    .filter_map(|aip| aip.to_string().parse().ok())
                    .collect(),
            })
            .collect())
    }
}

/// Linux kernel-based `WireGuard` backend for a single interface.
#[derive(Debug, Clone)]
pub struct LinuxKernel {
    ifname: String,
}

impl LinuxKernel {
    /// Creates a backend for the interface called `ifname`.
    #[must_use]
    pub fn new(ifname: impl Into<String>) -> Self {
        Self {
            ifname: ifname.into(),
        }
    }

    fn configure(&self, config: &InterfaceConfig) -> Result<()> {
        let mut wg = api(&self.ifname)?;

        let exists = wg.read_interface_data().is_ok();
        if !exists {
            wg.create_interface()
                .map_err(|e| WireGuardError::Interface(format!("create_interface: {e}")))?;
        }

        let address = to_ip_addr_mask(&host_network(config.address))?;
        wg.assign_address(&address)
            .map_err(|e| WireGuardError::Interface(format!("assign_address: {e}")))?;

        let iface_config = InterfaceConfiguration {
            name: self.ifname.clone(),
            prvkey: config.private_key.to_base64(),
            addresses: vec![address],
            port: config.listen_port.into(),
            peers: Vec::new(),
            mtu: None,
        };
        wg.configure_interface(&iface_config)
            .map_err(|e| WireGuardError::Interface(format!("configure_interface: {e}")))
    }

    async fn ip(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("ip")
            .args(args)
            .output()
            .await
            .map_err(|e| WireGuardError::Route(format!("ip {}: {e}", args.join(" "))))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WireGuardError::Route(format!(
                "ip {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// The device name in `ip route get` output (`... dev pp0 ...`).
fn route_device(output: &str) -> Option<&str> {
    let mut words = output.split_whitespace();
    words.find(|w| *w == "dev").and_then(|_| words.next())
}

impl KernelBackend for LinuxKernel {
    type Table = LinuxPeerTable;

    fn peer_table(&self) -> Self::Table {
        LinuxPeerTable {
            ifname: self.ifname.clone(),
        }
    }

    async fn setup(&mut self, config: &InterfaceConfig) -> Result<()> {
        info!(interface = %self.ifname, address = %config.address, port = config.listen_port, "Configuring WireGuard interface");
        self.configure(config)?;
        self.ip(&["link", "set", &self.ifname, "up"]).await?;
        info!(interface = %self.ifname, "WireGuard interface up");
        Ok(())
    }

    async fn add_route(&mut self, dst: IpNet) -> Result<()> {
        let dst = dst.to_string();
        self.ip(&["route", "replace", &dst, "dev", &self.ifname])
            .await
            .map(|_| ())
    }

    async fn remove_route(&mut self, dst: IpNet) -> Result<()> {
        let addr = dst.addr().to_string();
        let Ok(route) = self.ip(&["route", "get", &addr]).await else {
            debug!(dst = %dst, "No route to remove");
            return Ok(());
        };
        if route_device(&route) != Some(self.ifname.as_str()) {
            debug!(dst = %dst, interface = %self.ifname, "Route does not use interface, leaving it");
            return Ok(());
        }
        let dst = dst.to_string();
        self.ip(&["route", "del", &dst, "dev", &self.ifname])
            .await
            .map(|_| ())
    }

    async fn upsert_peer(&mut self, key: &PublicKey, allowed_ips: &[IpNet]) -> Result<()> {
        let mut peer = DgPeer::new(to_defguard_key(key)?);
        for net in allowed_ips {
            peer.allowed_ips.push(to_ip_addr_mask(net)?);
        }
        api(&self.ifname)?
            .configure_peer(&peer)
            .map_err(|e| WireGuardError::Interface(format!("configure_peer: {e}")))
    }

    async fn remove_peer(&mut self, key: &PublicKey) -> Result<()> {
        let dg_key = to_defguard_key(key)?;
        let wg = api(&self.ifname)?;
        let host = wg
            .read_interface_data()
            .map_err(|e| WireGuardError::Interface(format!("read_interface_data: {e}")))?;
        if !host.peers.contains_key(&dg_key) {
            return Ok(());
        }
        wg.remove_peer(&dg_key)
            .map_err(|e| WireGuardError::Interface(format!("remove_peer: {e}")))
    }

    async fn teardown(&mut self) -> Result<()> {
        info!(interface = %self.ifname, "Removing WireGuard interface");
        api(&self.ifname)?
            .remove_interface()
            .map_err(|e| WireGuardError::Interface(format!("remove_interface: {e}")))
    }
}
