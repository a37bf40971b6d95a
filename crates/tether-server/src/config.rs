//! Daemon configuration.
//!
//! Loaded from TOML. Every key is optional; a missing key takes the default
//! shown below.
//!
//! ```toml
//! listen = "0.0.0.0:8080"
//! subnet = "fd00::/32"
//! registry_file = "/etc/tether/registry.json"
//!
//! [delivery]
//! workers = 8
//! queue_capacity = 4096
//!
//! [kernel]
//! enabled = true
//! interface = "pp0"
//! address = "fd00::"
//! listen_port = 18732
//! private_key = "<base64>"
//!
//! [rendezvous]
//! port = 8743
//! ```

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};

use ipnet::{IpNet, Ipv6Net};
use serde::{Deserialize, Serialize};

use tether_gateway::{DEFAULT_QUEUE_CAPACITY, DeliveryConfig};
use tether_punch::DEFAULT_PORT as DEFAULT_RENDEZVOUS_PORT;
use tether_wireguard::{InterfaceConfig, PrivateKey};

use crate::error::{ServerError, ServerResult};

/// Default gateway listen address.
pub const DEFAULT_LISTEN: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8080);

/// Default kernel interface name.
pub const DEFAULT_INTERFACE: &str = "pp0";

/// Default WireGuard listen port.
pub const DEFAULT_WIREGUARD_PORT: u16 = 18732;

const DEFAULT_OVERLAY_ADDRESS: Ipv6Addr = Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 0);

fn default_subnet() -> IpNet {
    IpNet::V6(Ipv6Net::new_assert(DEFAULT_OVERLAY_ADDRESS, 32))
}

/// Delivery pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliverySection {
    /// Worker (and shard) count.
    pub workers: usize,
    /// Total queue capacity.
    pub queue_capacity: usize,
}

impl Default for DeliverySection {
    fn default() -> Self {
        let defaults = DeliveryConfig::default();
        Self {
            workers: defaults.workers,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl DeliverySection {
    /// The pool configuration these settings describe.
    #[must_use]
    pub fn to_delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig::default()
            .with_workers(self.workers)
            .with_queue_capacity(self.queue_capacity)
    }
}

/// Kernel `WireGuard` interface settings.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelSection {
    /// Whether to manage a kernel interface at all.
    pub enabled: bool,
    /// Interface name.
    pub interface: String,
    /// Our own overlay address.
    pub address: IpAddr,
    /// UDP listen port.
    pub listen_port: u16,
    /// Base64 private key. Required when enabled.
    pub private_key: String,
}

impl Default for KernelSection {
    fn default() -> Self {
        Self {
            enabled: false,
            interface: DEFAULT_INTERFACE.to_string(),
            address: IpAddr::V6(DEFAULT_OVERLAY_ADDRESS),
            listen_port: DEFAULT_WIREGUARD_PORT,
            private_key: String::new(),
        }
    }
}

impl fmt::Debug for KernelSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelSection")
            .field("enabled", &self.enabled)
            .field("interface", &self.interface)
            .field("address", &self.address)
            .field("listen_port", &self.listen_port)
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

impl KernelSection {
    /// Build the interface configuration, decoding the private key.
    ///
    /// # Errors
    ///
    /// Returns an error if the private key is not valid base64 of 32 bytes.
    pub fn interface_config(&self) -> ServerResult<InterfaceConfig> {
        let key = PrivateKey::from_base64(self.private_key.trim())
            .map_err(|e| ServerError::Config(format!("kernel.private_key: {e}")))?;
        Ok(InterfaceConfig::new(
            self.interface.clone(),
            self.address,
            self.listen_port,
            key,
        ))
    }
}

/// Rendezvous server settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendezvousSection {
    /// UDP port.
    pub port: u16,
    /// Explicit bind address, overriding the derived one.
    pub bind: Option<SocketAddr>,
}

impl Default for RendezvousSection {
    fn default() -> Self {
        Self {
            port: DEFAULT_RENDEZVOUS_PORT,
            bind: None,
        }
    }
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Gateway WebSocket listen address.
    pub listen: SocketAddr,
    /// Overlay subnet devices are allocated from.
    pub subnet: IpNet,
    /// JSON seed for the in-memory registry (users, devices, networks, tokens).
    pub registry_file: Option<PathBuf>,
    /// Delivery pool.
    pub delivery: DeliverySection,
    /// Kernel interface.
    pub kernel: KernelSection,
    /// Rendezvous server.
    pub rendezvous: RendezvousSection,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN,
            subnet: default_subnet(),
            registry_file: None,
            delivery: DeliverySection::default(),
            kernel: KernelSection::default(),
            rendezvous: RendezvousSection::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: impl AsRef<Path>) -> ServerResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ServerError::Config(format!(
                "failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed or validation fails.
    pub fn from_toml(content: &str) -> ServerResult<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| ServerError::Config(format!("invalid TOML: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> ServerResult<()> {
        if self.delivery.workers == 0 {
            return Err(ServerError::Config("delivery.workers must be at least 1".to_string()));
        }

        if self.delivery.queue_capacity == 0 {
            return Err(ServerError::Config(
                "delivery.queue_capacity must be at least 1".to_string(),
            ));
        }

        if !self.subnet.contains(&self.kernel.address) {
            return Err(ServerError::Config(format!(
                "kernel.address {} is outside subnet {}",
                self.kernel.address, self.subnet
            )));
        }

        if self.kernel.enabled {
            if self.kernel.interface.is_empty() {
                return Err(ServerError::Config("kernel.interface cannot be empty".to_string()));
            }
            if self.kernel.private_key.trim().is_empty() {
                return Err(ServerError::Config(
                    "kernel.private_key is required when the kernel interface is enabled".to_string(),
                ));
            }
            self.kernel.interface_config()?;
        }

        Ok(())
    }

    /// Where the rendezvous server binds.
    ///
    /// An explicit `rendezvous.bind` wins. Otherwise the server listens on the
    /// overlay address when the kernel interface is managed, and on every
    /// address when it is not.
    #[must_use]
    pub fn rendezvous_addr(&self) -> SocketAddr {
        if let Some(bind) = self.rendezvous.bind {
            return bind;
        }
        let ip = if self.kernel.enabled {
            self.kernel.address
        } else {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        };
        SocketAddr::new(ip, self.rendezvous.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use test_case::test_case;

    fn key() -> String {
        PrivateKey::generate().to_base64()
    }

    // ==================== Parsing Tests ====================

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = ServerConfig::from_toml("").expect("parse");
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.listen, "0.0.0.0:8080".parse().expect("addr"));
        assert_eq!(config.subnet, "fd00::/32".parse().expect("net"));
        assert_eq!(config.kernel.interface, "pp0");
        assert_eq!(config.kernel.listen_port, 18732);
        assert_eq!(config.delivery.queue_capacity, 4096);
        assert!(config.delivery.workers >= 1);
        assert_eq!(config.rendezvous.port, 8743);
        assert!(!config.kernel.enabled);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = format!(
            r#"
listen = "127.0.0.1:9000"
subnet = "10.64.0.0/10"
registry_file = "/var/lib/tether/registry.json"

[delivery]
workers = 3
queue_capacity = 99

[kernel]
enabled = true
interface = "tether0"
address = "10.64.0.1"
listen_port = 51820
private_key = "{}"

[rendezvous]
port = 9999
bind = "0.0.0.0:9999"
"#,
            key()
        );

        let config = ServerConfig::from_toml(&toml).expect("parse");
        assert_eq!(config.listen.port(), 9000);
        assert_eq!(
            config.registry_file.as_deref(),
            Some(Path::new("/var/lib/tether/registry.json"))
        );
        assert_eq!(config.delivery.workers, 3);
        assert_eq!(config.delivery.to_delivery_config().queue_capacity, 99);
        assert_eq!(config.kernel.interface, "tether0");
        assert_eq!(config.rendezvous_addr(), "0.0.0.0:9999".parse().expect("addr"));

        let iface = config.kernel.interface_config().expect("interface");
        assert_eq!(iface.name, "tether0");
        assert_eq!(iface.listen_port, 51820);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().expect("temp file");
        writeln!(file, "listen = \"127.0.0.1:7000\"").expect("write");

        let config = ServerConfig::from_file(file.path()).expect("load");
        assert_eq!(config.listen.port(), 7000);
    }

    #[test]
    fn test_file_not_found() {
        let err = ServerConfig::from_file("/nonexistent/tetherd.toml").expect_err("missing");
        assert!(err.to_string().contains("failed to read config file"));
    }

    #[test]
    fn test_invalid_toml() {
        let err = ServerConfig::from_toml("listen = ").expect_err("invalid");
        assert!(err.to_string().contains("invalid TOML"));
    }

    // ==================== Validation Tests ====================

    #[test_case("[delivery]\nworkers = 0", "delivery.workers" ; "zero workers")]
    #[test_case("[delivery]\nqueue_capacity = 0", "delivery.queue_capacity" ; "zero capacity")]
    #[test_case("[kernel]\nenabled = true", "private_key is required" ; "missing key")]
    #[test_case("[kernel]\nenabled = true\nprivate_key = \"  \"", "private_key is required" ; "blank key")]
    #[test_case("[kernel]\nenabled = true\nprivate_key = \"bm90LWEta2V5\"", "kernel.private_key" ; "short key")]
    #[test_case("[kernel]\naddress = \"10.0.0.1\"", "outside subnet" ; "address outside subnet")]
    fn test_validation_rejects(toml: &str, needle: &str) {
        let err = ServerConfig::from_toml(toml).expect_err("invalid");
        assert!(
            err.to_string().contains(needle),
            "expected {needle:?} in {err}"
        );
    }

    #[test]
    fn test_empty_interface_rejected_when_enabled() {
        let toml = format!("[kernel]\nenabled = true\ninterface = \"\"\nprivate_key = \"{}\"", key());
        assert!(ServerConfig::from_toml(&toml).is_err());
    }

    // ==================== Rendezvous Address Tests ====================

    #[test]
    fn test_rendezvous_binds_everywhere_without_kernel() {
        let config = ServerConfig::default();
        assert_eq!(config.rendezvous_addr(), "[::]:8743".parse().expect("addr"));
    }

    #[test]
    fn test_rendezvous_binds_overlay_address_with_kernel() {
        let toml = format!("[kernel]\nenabled = true\naddress = \"fd00::1\"\nprivate_key = \"{}\"", key());
        let config = ServerConfig::from_toml(&toml).expect("parse");
        assert_eq!(config.rendezvous_addr(), "[fd00::1]:8743".parse().expect("addr"));
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let mut config = ServerConfig::default();
        config.kernel.private_key = key();
        let debug = format!("{config:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains(&config.kernel.private_key));
    }
}
