//! Gateway message definitions.
//!
//! Every frame on the gateway WebSocket is one JSON object tagged by `type`:
//!
//! - `ping` (peer → gateway): "device `device_id` is reachable at `endpoint`"
//! - `dev_update` (gateway → peer): a device changed its endpoint
//! - `network_join` (gateway → peer): a device became reachable through a network
//! - `network_leave` (gateway → peer): a device is no longer reachable at all

use serde::{Deserialize, Serialize};

use crate::error::ProtoError;
use crate::types::{Device, DeviceId, Network};

/// A message exchanged over the gateway connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayMessage {
    /// Endpoint report from a peer.
    ///
    /// Missing fields decode to their defaults so that the gateway can
    /// reject them through [`GatewayMessage::is_valid_ping`] instead of
    /// failing the whole frame.
    Ping {
        /// Device the endpoint belongs to.
        #[serde(default)]
        device_id: DeviceId,
        /// Reported endpoint (`host:port`).
        #[serde(default)]
        endpoint: String,
    },
    /// A device's endpoint changed.
    DevUpdate {
        /// The updated device.
        device: Device,
    },
    /// `device` shares `network` with the recipient.
    NetworkJoin {
        /// The device that is now reachable.
        device: Device,
        /// The network through which it is reachable.
        network: Network,
    },
    /// The recipient no longer shares any network with `device`.
    NetworkLeave {
        /// The device to forget.
        device: Device,
        /// The network that was left.
        network: Network,
        /// Always set on notices produced by the gateway.
        #[serde(default)]
        remove: bool,
    },
}

impl GatewayMessage {
    /// Create a ping.
    #[must_use]
    pub fn ping(device_id: DeviceId, endpoint: impl Into<String>) -> Self {
        Self::Ping {
            device_id,
            endpoint: endpoint.into(),
        }
    }

    /// Create a device update.
    #[must_use]
    pub const fn dev_update(device: Device) -> Self {
        Self::DevUpdate { device }
    }

    /// Create a join announcement.
    #[must_use]
    pub const fn network_join(device: Device, network: Network) -> Self {
        Self::NetworkJoin { device, network }
    }

    /// Create a removal notice.
    #[must_use]
    pub const fn network_leave(device: Device, network: Network) -> Self {
        Self::NetworkLeave {
            device,
            network,
            remove: true,
        }
    }

    /// The wire name of this message's `type` tag.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Ping { .. } => "ping",
            Self::DevUpdate { .. } => "dev_update",
            Self::NetworkJoin { .. } => "network_join",
            Self::NetworkLeave { .. } => "network_leave",
        }
    }

    /// A ping must name a real device and carry a non-empty endpoint.
    #[must_use]
    pub fn is_valid_ping(&self) -> bool {
        matches!(self, Self::Ping { device_id, endpoint } if device_id.is_valid() && !endpoint.is_empty())
    }

    /// The device this message is about, if any.
    #[must_use]
    pub const fn subject(&self) -> Option<&Device> {
        match self {
            Self::Ping { .. } => None,
            Self::DevUpdate { device }
            | Self::NetworkJoin { device, .. }
            | Self::NetworkLeave { device, .. } => Some(device),
        }
    }

    /// Serialize to JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, ProtoError> {
        serde_json::to_string(self).map_err(|e| ProtoError::Encoding(e.to_string()))
    }

    /// Deserialize from JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a known gateway message.
    pub fn from_json(json: &str) -> Result<Self, ProtoError> {
        serde_json::from_str(json).map_err(|e| ProtoError::Decoding(e.to_string()))
    }
}
