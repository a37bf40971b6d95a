//! Error types for the rendezvous protocol.

use std::net::IpAddr;

use thiserror::Error;

/// Errors produced by the rendezvous server, its lookups, and the probe client.
#[derive(Debug, Error)]
pub enum PunchError {
    /// Socket I/O failed.
    #[error("socket error: {0}")]
    Io(String),

    /// No kernel peer routes the probing address.
    #[error("no peer found for {0}")]
    NotFound(IpAddr),

    /// A lookup backend failed.
    #[error("lookup failed: {0}")]
    Lookup(String),

    /// A reply was not a NUL-terminated endpoint string.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// No reply arrived in time.
    #[error("timed out waiting for rendezvous reply")]
    Timeout,
}

impl From<std::io::Error> for PunchError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Result type for rendezvous operations.
pub type Result<T> = std::result::Result<T, PunchError>;
