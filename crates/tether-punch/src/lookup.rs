//! Source-address lookups.
//!
//! A [`Lookup`] turns the address a probe arrived from into the endpoint
//! string sent back to the prober.

use std::future::Future;
use std::net::SocketAddr;

use tether_wireguard::PeerTable;

use crate::error::{PunchError, Result};

/// Maps a probe's source address to the endpoint string to report.
pub trait Lookup: Send + Sync {
    /// Resolve `addr`.
    fn lookup(&self, addr: SocketAddr) -> impl Future<Output = Result<String>> + Send;
}

impl<F, Fut> Lookup for F
where
    F: Fn(SocketAddr) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String>> + Send,
{
    fn lookup(&self, addr: SocketAddr) -> impl Future<Output = Result<String>> + Send {
        self(addr)
    }
}

/// IPv4-mapped IPv6 sources are reported in their IPv4 form.
fn canonical(addr: SocketAddr) -> SocketAddr {
    SocketAddr::new(addr.ip().to_canonical(), addr.port())
}

/// Reports the observed source address itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceAddrLookup;

impl Lookup for SourceAddrLookup {
    async fn lookup(&self, addr: SocketAddr) -> Result<String> {
        Ok(canonical(addr).to_string())
    }
}

/// Reports the underlay endpoint of the kernel peer that owns the probing
/// overlay address.
///
/// Used when probes arrive through the WireGuard interface: the source is an
/// overlay address, and the interesting answer is where the kernel last saw
/// that peer's encrypted traffic come from.
#[derive(Debug, Clone)]
pub struct MeshLookup<T> {
    table: T,
}

impl<T: PeerTable + Clone + 'static> MeshLookup<T> {
    /// Look peers up in `table`.
    #[must_use]
    pub const fn new(table: T) -> Self {
        Self { table }
    }
}

impl<T: PeerTable + Clone + 'static> Lookup for MeshLookup<T> {
    async fn lookup(&self, addr: SocketAddr) -> Result<String> {
        let ip = canonical(addr).ip();
        // Kernel peer dumps are blocking netlink reads.
        let table = self.table.clone();
        let peers = tokio::task::spawn_blocking(move || table.peers())
            .await
            .map_err(|e| PunchError::Lookup(e.to_string()))?
            .map_err(|e| PunchError::Lookup(e.to_string()))?;

        peers
            .into_iter()
            .find(|peer| peer.routes(ip))
            .and_then(|peer| peer.endpoint)
            .map(|endpoint| endpoint.to_string())
            .ok_or(PunchError::NotFound(ip))
    }
}
