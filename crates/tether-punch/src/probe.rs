//! Client side of the rendezvous protocol.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;

use crate::error::{PunchError, Result};
use crate::server::MAX_RESPONSE_LEN;

/// How long [`probe`] waits for a reply.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Decode a NUL-terminated reply.
///
/// # Errors
///
/// Returns an error if the terminator is missing or the text is not UTF-8.
pub fn decode_response(buf: &[u8]) -> Result<String> {
    let Some((&0, text)) = buf.split_last() else {
        return Err(PunchError::InvalidResponse("missing NUL terminator".into()));
    };
    if text.len() > MAX_RESPONSE_LEN {
        return Err(PunchError::InvalidResponse(format!("{} bytes", text.len())));
    }
    String::from_utf8(text.to_vec()).map_err(|e| PunchError::InvalidResponse(e.to_string()))
}

/// Ask `server` which endpoint it sees this socket at.
///
/// Sends an empty datagram and waits up to [`DEFAULT_PROBE_TIMEOUT`].
pub async fn probe(socket: &UdpSocket, server: SocketAddr) -> Result<String> {
    probe_with_timeout(socket, server, DEFAULT_PROBE_TIMEOUT).await
}

/// [`probe`] with an explicit timeout. Datagrams from other sources are ignored.
///
/// # Errors
///
/// Returns [`PunchError::Timeout`] if no reply arrives in time.
pub async fn probe_with_timeout(
    socket: &UdpSocket,
    server: SocketAddr,
    timeout: Duration,
) -> Result<String> {
    socket.send_to(&[], server).await?;

    let mut buf = [0u8; MAX_RESPONSE_LEN + 1];
    tokio::time::timeout(timeout, async {
        loop {
            let (len, from) = socket.recv_from(&mut buf).await?;
            if from == server {
                return decode_response(&buf[..len]);
            }
        }
    })
    .await
    .map_err(|_| PunchError::Timeout)?
}
