//! The rendezvous server loop.
//!
//! Every datagram, whatever its payload, is answered with the looked-up
//! endpoint followed by a single NUL byte. Failed or oversized lookups are
//! answered with silence.

use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{PunchError, Result};
use crate::lookup::{Lookup, SourceAddrLookup};

/// Default rendezvous UDP port.
pub const DEFAULT_PORT: u16 = 8743;

/// Longest endpoint string that will be sent back.
pub const MAX_RESPONSE_LEN: usize = 64;

/// Build the reply datagram for `endpoint`, or `None` if it is too long.
#[must_use]
pub fn encode_response(endpoint: &str) -> Option<Vec<u8>> {
    if endpoint.len() > MAX_RESPONSE_LEN {
        return None;
    }
    let mut buf = Vec::with_capacity(endpoint.len() + 1);
    buf.extend_from_slice(endpoint.as_bytes());
    buf.push(0);
    Some(buf)
}

/// Stateless UDP request/response server.
#[derive(Debug)]
pub struct RendezvousServer<L = SourceAddrLookup> {
    socket: UdpSocket,
    lookup: L,
}

impl RendezvousServer<SourceAddrLookup> {
    /// Bind a server using the default lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| PunchError::Io(format!("bind {addr}: {e}")))?;
        Ok(Self::new(socket, SourceAddrLookup))
    }
}

impl<L: Lookup> RendezvousServer<L> {
    /// Serve on an already bound socket.
    #[must_use]
    pub const fn new(socket: UdpSocket, lookup: L) -> Self {
        Self { socket, lookup }
    }

    /// Replace the lookup.
    #[must_use]
    pub fn with_lookup<M: Lookup>(self, lookup: M) -> RendezvousServer<M> {
        RendezvousServer {
            socket: self.socket,
            lookup,
        }
    }

    /// The address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Answer probes until `cancel` fires or the socket fails.
    ///
    /// Requests are handled one at a time.
    ///
    /// # Errors
    ///
    /// Returns an error if receiving from the socket fails.
    pub async fn serve(self, cancel: CancellationToken) -> Result<()> {
        let local = self.local_addr()?;
        info!(addr = %local, "Rendezvous server listening");

        let mut buf = [0u8; 1500];
        loop {
            let received = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    info!(addr = %local, "Rendezvous server stopped");
                    return Ok(());
                }
                received = self.socket.recv_from(&mut buf) => received,
            };

            match received {
                Ok((_, from)) => self.respond(from).await,
                Err(e) => {
                    warn!(addr = %local, error = %e, "Rendezvous socket failed");
                    return Err(e.into());
                }
            }
        }
    }

    async fn respond(&self, from: SocketAddr) {
        let endpoint = match self.lookup.lookup(from).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                debug!(addr = %from, error = %e, "Lookup failed, ignoring probe");
                return;
            }
        };

        let Some(reply) = encode_response(&endpoint) else {
            debug!(addr = %from, len = endpoint.len(), "Lookup result too long, ignoring probe");
            return;
        };

        if let Err(e) = self.socket.send_to(&reply, from).await {
            debug!(addr = %from, error = %e, "Failed to send rendezvous reply");
        }
    }
}
