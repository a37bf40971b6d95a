//! A single peer's gateway connection.

use std::fmt;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use futures::{Sink, SinkExt, future};
use tokio::sync::{Mutex, MutexGuard};
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};

use tether_proto::{DeviceId, GatewayMessage, User};

use crate::error::{GatewayError, Result};

/// Outbound half of a connection, already speaking [`GatewayMessage`].
pub type MessageSink = Pin<Box<dyn Sink<GatewayMessage, Error = GatewayError> + Send>>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Adapt a WebSocket sink to carry gateway messages as JSON text frames.
pub fn websocket_sink<S>(sink: S) -> MessageSink
where
    S: Sink<WsMessage, Error = tungstenite::Error> + Send + 'static,
{
    Box::pin(
        sink.sink_map_err(GatewayError::from)
            .with(|msg: GatewayMessage| {
                future::ready(msg.to_json().map(WsMessage::Text).map_err(GatewayError::from))
            }),
    )
}

/// A live, authenticated peer connection.
///
/// The device binding starts unset and is claimed by the first authorized
/// ping. Message handling for one connection is serialized through
/// [`GatewayConnection::lock_handling`]; writes are serialized separately so a
/// delivery worker never waits on an in-progress ping.
pub struct GatewayConnection {
    id: u64,
    user: User,
    device: AtomicI64,
    source_ip: IpAddr,
    handling: Mutex<()>,
    sink: Mutex<MessageSink>,
}

impl GatewayConnection {
    /// Create an unbound connection writing to `sink`.
    pub fn new<S>(user: User, source_ip: IpAddr, sink: S) -> Self
    where
        S: Sink<GatewayMessage, Error = GatewayError> + Send + 'static,
    {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            user,
            device: AtomicI64::new(0),
            source_ip,
            handling: Mutex::new(()),
            sink: Mutex::new(Box::pin(sink)),
        }
    }

    /// Process-unique connection id.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// The authenticated user.
    #[must_use]
    pub const fn user(&self) -> &User {
        &self.user
    }

    /// Address the connection was accepted from.
    #[must_use]
    pub const fn source_ip(&self) -> IpAddr {
        self.source_ip
    }

    /// The bound device, if a ping has claimed the connection.
    #[must_use]
    pub fn device_id(&self) -> Option<DeviceId> {
        let id = DeviceId::new(self.device.load(Ordering::Acquire));
        id.is_valid().then_some(id)
    }

    /// Whether this connection is bound to `device`.
    #[must_use]
    pub fn is_bound_to(&self, device: DeviceId) -> bool {
        device.is_valid() && self.device.load(Ordering::Acquire) == device.get()
    }

    /// Bind the connection to `device` unless it is already bound.
    ///
    /// Returns `true` if this call performed the binding.
    pub fn bind_device(&self, device: DeviceId) -> bool {
        device.is_valid()
            && self
                .device
                .compare_exchange(0, device.get(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    /// Serialize inbound message handling for this connection.
    pub async fn lock_handling(&self) -> MutexGuard<'_, ()> {
        self.handling.lock().await
    }

    /// Write one message and flush it.
    pub async fn send(&self, msg: GatewayMessage) -> Result<()> {
        let mut sink = self.sink.lock().await;
        sink.send(msg).await
    }

    /// Close the outbound half.
    pub async fn close(&self) -> Result<()> {
        let mut sink = self.sink.lock().await;
        sink.close().await
    }
}

impl fmt::Debug for GatewayConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConnection")
            .field("id", &self.id)
            .field("user", &self.user.id)
            .field("device", &self.device_id())
            .field("source_ip", &self.source_ip)
            .finish_non_exhaustive()
    }
}
