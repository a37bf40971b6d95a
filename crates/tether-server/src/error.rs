//! Error types for the Tether daemon.

use std::net::SocketAddr;

use tether_punch::PunchError;
use tether_store::StoreError;
use tether_wireguard::WireGuardError;
use thiserror::Error;

/// Errors that can occur while configuring or running the daemon.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to the specified address.
    #[error("failed to bind to {0}: {1}")]
    BindFailed(SocketAddr, std::io::Error),

    /// The configuration is unreadable or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// The device registry failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The kernel interface could not be configured.
    #[error("wireguard error: {0}")]
    WireGuard(#[from] WireGuardError),

    /// The rendezvous server failed.
    #[error("rendezvous error: {0}")]
    Rendezvous(#[from] PunchError),

    /// An I/O error outside of binding.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;
