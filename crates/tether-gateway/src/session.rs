//! Per-connection session loop.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::{Sink, Stream, StreamExt};
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_proto::{DeviceId, GatewayMessage, User};
use tether_store::{Store, StoreError};

use crate::connection::{GatewayConnection, websocket_sink};
use crate::notify::NotificationEngine;
use crate::registry::ConnectionRegistry;

/// Shared state every session needs.
#[derive(Clone)]
pub struct GatewayContext {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn Store>,
    engine: NotificationEngine,
}

impl GatewayContext {
    /// Bundle the collaborators of a gateway.
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>, store: Arc<dyn Store>, engine: NotificationEngine) -> Self {
        Self {
            registry,
            store,
            engine,
        }
    }

    /// The live connection registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// The notification engine.
    #[must_use]
    pub const fn engine(&self) -> &NotificationEngine {
        &self.engine
    }
}

impl fmt::Debug for GatewayContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayContext")
            .field("connections", &self.registry.len())
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

/// Run one authenticated peer connection until it closes.
///
/// The connection is registered for the whole session and always
/// unregistered on return. Text frames are decoded as [`GatewayMessage`];
/// malformed JSON is logged and skipped, control and binary frames are
/// ignored. The loop ends on a close frame, a read error, or `cancel`.
pub async fn accept_gateway_connection<T>(
    transport: T,
    user: User,
    source_addr: SocketAddr,
    ctx: GatewayContext,
    cancel: CancellationToken,
) where
    T: Stream<Item = Result<WsMessage, tungstenite::Error>>
        + Sink<WsMessage, Error = tungstenite::Error>
        + Send
        + 'static,
{
    let (sink, mut frames) = transport.split();
    let conn = Arc::new(GatewayConnection::new(
        user,
        source_addr.ip().to_canonical(),
        websocket_sink(sink),
    ));
    ctx.registry.register(Arc::clone(&conn));
    info!(conn = conn.id(), user_id = %conn.user().id, addr = %source_addr, "Gateway session started");

    loop {
        let frame = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            frame = frames.next() => frame,
        };

        match frame {
            Some(Ok(WsMessage::Text(text))) => handle_text(&ctx, &conn, &text).await,
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(conn = conn.id(), error = %e, "Gateway read failed");
                break;
            }
        }
    }

    ctx.registry.unregister(&conn);
    if let Err(e) = conn.close().await {
        debug!(conn = conn.id(), error = %e, "Closing gateway connection failed");
    }
    info!(conn = conn.id(), device_id = ?conn.device_id(), "Gateway session ended");
}

async fn handle_text(ctx: &GatewayContext, conn: &GatewayConnection, text: &str) {
    let message = match GatewayMessage::from_json(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(conn = conn.id(), error = %e, "Skipping malformed gateway frame");
            return;
        }
    };

    if !message.is_valid_ping() {
        debug!(conn = conn.id(), kind = message.kind(), "Ignoring inbound message");
        return;
    }
    if let GatewayMessage::Ping { device_id, endpoint } = message {
        handle_ping(ctx, conn, device_id, endpoint).await;
    }
}

async fn handle_ping(ctx: &GatewayContext, conn: &GatewayConnection, device_id: DeviceId, endpoint: String) {
    let _handling = conn.lock_handling().await;

    let mut device = match ctx.store.device_by_id(device_id) {
        Ok(device) => device,
        Err(StoreError::DeviceNotFound(_)) => {
            debug!(conn = conn.id(), device_id = %device_id, "Ping for unknown device");
            return;
        }
        Err(e) => {
            warn!(conn = conn.id(), device_id = %device_id, error = %e, "Device lookup failed");
            return;
        }
    };

    if !device.is_owned_by(conn.user().id) {
        debug!(conn = conn.id(), device_id = %device_id, user_id = %conn.user().id, "Unauthorized ping");
        return;
    }

    if conn.bind_device(device_id) {
        info!(conn = conn.id(), device_id = %device_id, "Connection bound to device");
    }

    if device.endpoint.as_deref() == Some(endpoint.as_str()) {
        return;
    }

    debug!(device_id = %device_id, endpoint = %endpoint, "Device endpoint changed");
    device.endpoint = Some(endpoint);
    if let Err(e) = ctx.store.save_device(&device) {
        warn!(device_id = %device_id, error = %e, "Saving device endpoint failed");
        return;
    }

    ctx.engine.on_device_endpoint_change(&device).await;
}
