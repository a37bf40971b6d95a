//! Error types for store operations.

use thiserror::Error;

/// Errors returned by a [`Store`](crate::Store).
#[derive(Debug, Error)]
pub enum StoreError {
    /// No user with this id.
    #[error("user {0} not found")]
    UserNotFound(i64),

    /// No device with this id.
    #[error("device {0} not found")]
    DeviceNotFound(i64),

    /// No network with this id.
    #[error("network {0} not found")]
    NetworkNotFound(i64),

    /// A uniqueness constraint would be violated.
    #[error("conflict: {0}")]
    Conflict(String),

    /// No free overlay address could be found.
    #[error("no free overlay address in {0}")]
    SubnetExhausted(String),

    /// The seed file could not be read or parsed.
    #[error("invalid seed: {0}")]
    Seed(String),

    /// The backing store failed.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_messages_name_the_id() {
        assert_eq!(StoreError::DeviceNotFound(4).to_string(), "device 4 not found");
        assert_eq!(StoreError::NetworkNotFound(2).to_string(), "network 2 not found");
    }

    #[test]
    fn conflict_display() {
        let err = StoreError::Conflict("device 1 already in network 2".into());
        assert!(err.to_string().contains("already in network"));
    }
}
