//! Core data model shared between the persistence layer and the coordination core.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

macro_rules! integer_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Wrap a raw identifier.
            #[must_use]
            pub const fn new(id: i64) -> Self {
                Self(id)
            }

            /// Get the raw identifier.
            #[must_use]
            pub const fn get(self) -> i64 {
                self.0
            }

            /// Identifiers assigned by the persistence layer are always positive.
            #[must_use]
            pub const fn is_valid(self) -> bool {
                self.0 > 0
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

integer_id!(
    /// Identifier of a user account.
    UserId
);

integer_id!(
    /// Identifier of a member device.
    ///
    /// `DeviceId::default()` (zero) means "no device", which is what an unbound
    /// gateway connection carries until its first authorized ping.
    DeviceId
);

integer_id!(
    /// Identifier of a logical network.
    NetworkId
);

/// A user account. Only the id matters to the coordination core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// User ID.
    pub id: UserId,
    /// Login name.
    pub username: String,
    /// Contact address.
    pub email: String,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl User {
    /// Create a user with no display name.
    #[must_use]
    pub fn new(id: UserId, username: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
            email: email.into(),
            name: None,
        }
    }
}

/// A member device of the mesh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Device ID.
    pub id: DeviceId,
    /// Owning user.
    pub owner: UserId,
    /// Display name.
    pub name: String,
    /// WireGuard public key, base64 encoded.
    #[serde(rename = "key")]
    pub public_key: String,
    /// Overlay address, unique within the configured subnet.
    pub ip: IpAddr,
    /// Last endpoint (`host:port`) the device reported, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl Device {
    /// Create a device that has not reported an endpoint yet.
    #[must_use]
    pub fn new(
        id: DeviceId,
        owner: UserId,
        name: impl Into<String>,
        public_key: impl Into<String>,
        ip: IpAddr,
    ) -> Self {
        Self {
            id,
            owner,
            name: name.into(),
            public_key: public_key.into(),
            ip,
            endpoint: None,
        }
    }

    /// Set the endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Whether `user` owns this device.
    #[must_use]
    pub fn is_owned_by(&self, user: UserId) -> bool {
        self.owner == user
    }
}

/// A logical network that devices join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    /// Network ID.
    pub id: NetworkId,
    /// Owning user.
    pub owner: UserId,
    /// Network name.
    pub name: String,
}

impl Network {
    /// Create a network.
    #[must_use]
    pub fn new(id: NetworkId, owner: UserId, name: impl Into<String>) -> Self {
        Self {
            id,
            owner,
            name: name.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    fn device() -> Device {
        Device::new(
            DeviceId::new(7),
            UserId::new(1),
            "laptop",
            "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=",
            IpAddr::V6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 7)),
        )
    }

    #[test]
    fn ids_serialize_as_plain_integers() {
        let json = serde_json::to_string(&DeviceId::new(42)).expect("serialize");
        assert_eq!(json, "42");
        let id: NetworkId = serde_json::from_str("9").expect("deserialize");
        assert_eq!(id.get(), 9);
    }

    #[test]
    fn default_device_id_is_unbound() {
        assert!(!DeviceId::default().is_valid());
        assert!(DeviceId::new(1).is_valid());
        assert!(!DeviceId::new(-3).is_valid());
    }

    #[test]
    fn device_key_field_is_named_key() {
        let json = serde_json::to_value(device()).expect("serialize");
        assert!(json.get("key").is_some());
        assert!(json.get("public_key").is_none());
        assert!(json.get("endpoint").is_none());
    }

    #[test]
    fn device_endpoint_is_optional_on_the_wire() {
        let json = r#"{"id":3,"owner":1,"name":"n","key":"k","ip":"fd00::3"}"#;
        let dev: Device = serde_json::from_str(json).expect("deserialize");
        assert_eq!(dev.endpoint, None);
        assert_eq!(dev.ip, "fd00::3".parse::<IpAddr>().expect("ip"));
    }

    #[test]
    fn ownership_check() {
        let dev = device();
        assert!(dev.is_owned_by(UserId::new(1)));
        assert!(!dev.is_owned_by(UserId::new(2)));
    }
}
