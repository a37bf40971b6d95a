//! # tether-store
//!
//! The persistence collaborator seen from the coordination core.
//!
//! - [`Store`] - the read/write surface the core depends on
//! - [`MemoryStore`] - an in-process registry used by tests and single-node deployments
//! - [`overlay`] - overlay address allocation inside the configured subnet

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod memory;
pub mod overlay;

use tether_proto::{Device, DeviceId, Network, NetworkId};

pub use error::{Result, StoreError};
pub use memory::{MemoryStore, Seed};

/// Registry of devices and network membership.
///
/// All calls are synchronous and either return or fail; there is no
/// transaction spanning several calls.
pub trait Store: Send + Sync {
    /// Look up a device.
    fn device_by_id(&self, id: DeviceId) -> Result<Device>;

    /// Every registered device.
    fn all_devices(&self) -> Result<Vec<Device>>;

    /// Current members of a network.
    fn devices_in_network(&self, network: NetworkId) -> Result<Vec<Device>>;

    /// Networks a device is currently a member of.
    fn networks_of_device(&self, device: DeviceId) -> Result<Vec<Network>>;

    /// Persist changes to an existing device (the core only changes `endpoint`).
    fn save_device(&self, device: &Device) -> Result<()>;
}
