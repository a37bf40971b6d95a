//! WebSocket gateway listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{StatusCode, header};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_gateway::{GatewayContext, accept_gateway_connection};
use tether_proto::User;

use crate::auth::{Authenticator, bearer_token};
use crate::error::{ServerError, ServerResult};

/// How long a client may take to complete the WebSocket handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Accepts peer connections, authenticates them, and runs their sessions.
pub struct GatewayServer<A> {
    listener: TcpListener,
    auth: Arc<A>,
    ctx: GatewayContext,
}

impl<A> std::fmt::Debug for GatewayServer<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayServer")
            .field("addr", &self.listener.local_addr().ok())
            .field("ctx", &self.ctx)
            .finish_non_exhaustive()
    }
}

impl<A: Authenticator> GatewayServer<A> {
    /// Bind the listener.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::BindFailed`] if the address cannot be bound.
    pub async fn bind(addr: SocketAddr, auth: A, ctx: GatewayContext) -> ServerResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindFailed(addr, e))?;
        Ok(Self {
            listener,
            auth: Arc::new(auth),
            ctx,
        })
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> ServerResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `cancel` fires, then wait for every session
    /// to end.
    ///
    /// # Errors
    ///
    /// Returns an error only if the listener address cannot be read.
    pub async fn serve(self, cancel: CancellationToken) -> ServerResult<()> {
        let addr = self.local_addr()?;
        info!(addr = %addr, "Gateway server listening");

        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        sessions.spawn(handle_connection(
                            stream,
                            peer,
                            Arc::clone(&self.auth),
                            self.ctx.clone(),
                            cancel.child_token(),
                        ));
                    }
                    Err(e) => warn!(error = %e, "Failed to accept connection"),
                },
            }
        }

        info!(addr = %addr, sessions = sessions.len(), "Gateway server shutting down");
        while sessions.join_next().await.is_some() {}
        Ok(())
    }
}

fn unauthorized() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("unauthorized".to_string()));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}

async fn handle_connection<A: Authenticator>(
    stream: TcpStream,
    peer: SocketAddr,
    auth: Arc<A>,
    ctx: GatewayContext,
    cancel: CancellationToken,
) {
    debug!(peer = %peer, "New connection");

    let mut user: Option<User> = None;
    let callback = |req: &Request, response: Response| {
        let found = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(bearer_token)
            .and_then(|token| auth.authenticate(token));
        match found {
            Some(found) => {
                user = Some(found);
                Ok(response)
            }
            None => Err(unauthorized()),
        }
    };

    let ws = match tokio::time::timeout(HANDSHAKE_TIMEOUT, accept_hdr_async(stream, callback)).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            debug!(peer = %peer, error = %e, "WebSocket handshake rejected");
            return;
        }
        Err(_) => {
            debug!(peer = %peer, "WebSocket handshake timed out");
            return;
        }
    };

    let Some(user) = user else {
        return;
    };
    accept_gateway_connection(ws, user, peer, ctx, cancel).await;
}
