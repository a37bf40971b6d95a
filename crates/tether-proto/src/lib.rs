//! # tether-proto
//!
//! Shared data model and the gateway wire protocol for Tether.
//!
//! The data model mirrors what the persistence layer owns ([`User`], [`Device`],
//! [`Network`]); the coordination core only ever reads these values or writes a
//! device's endpoint back. [`GatewayMessage`] is the JSON message exchanged with
//! connected peers over the gateway WebSocket.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod messages;
pub mod types;

pub use error::ProtoError;
pub use messages::GatewayMessage;
pub use types::{Device, DeviceId, Network, NetworkId, User, UserId};
