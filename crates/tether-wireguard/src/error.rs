//! Error types for WireGuard operations.

use thiserror::Error;

use tether_store::StoreError;

/// Errors that can occur while handling keys or driving the kernel interface.
#[derive(Debug, Error)]
pub enum WireGuardError {
    /// Invalid base64 encoding.
    #[error("invalid base64 encoding: {0}")]
    InvalidBase64(String),

    /// Invalid key length.
    #[error("invalid key length: expected 32, got {0}")]
    InvalidKeyLength(usize),

    /// The kernel rejected an interface or peer operation.
    #[error("interface error: {0}")]
    Interface(String),

    /// A route could not be installed, inspected, or removed.
    #[error("route error: {0}")]
    Route(String),

    /// The reconciler no longer accepts events.
    #[error("peer reconciler is closed")]
    ReconcilerClosed,

    /// Reading devices for the initial sync failed.
    #[error("device registry: {0}")]
    Store(#[from] StoreError),
}

/// Result type for WireGuard operations.
pub type Result<T> = std::result::Result<T, WireGuardError>;
