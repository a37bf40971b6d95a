//! Error types for the gateway core.

use std::time::Duration;

use tether_proto::ProtoError;
use tether_store::StoreError;
use thiserror::Error;

/// Errors that can occur while handling gateway connections.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Writing to or reading from the transport failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// A write did not complete in time.
    #[error("send timed out after {0:?}")]
    Timeout(Duration),

    /// The peer closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// The delivery pool has been stopped.
    #[error("delivery pool is closed")]
    PoolClosed,

    /// A message could not be encoded or decoded.
    #[error(transparent)]
    Protocol(#[from] ProtoError),

    /// The device registry failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<tokio_tungstenite::tungstenite::Error> for GatewayError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => Self::ConnectionClosed,
            other => Self::Transport(other.to_string()),
        }
    }
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
