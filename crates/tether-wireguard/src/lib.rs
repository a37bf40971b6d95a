//! # tether-wireguard
//!
//! WireGuard key types and the kernel peer reconciler for Tether.
//!
//! - [`keys`] - Curve25519 key types with base64 text form
//! - [`KernelBackend`] / [`PeerTable`] - the kernel interface seam
//! - [`FakeKernel`] - in-memory backend for tests
//! - `LinuxKernel` - netlink backend (feature `linux`)
//! - [`KernelPeerReconciler`] - the single task that mutates the interface
//!
//! ## Example
//!
//! ```rust,no_run
//! use tether_store::MemoryStore;
//! use tether_wireguard::{FakeKernel, InterfaceConfig, KernelPeerReconciler, PrivateKey};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = MemoryStore::new("fd00::/32".parse()?);
//! let config = InterfaceConfig::new("pp0", "fd00::".parse()?, 18732, PrivateKey::generate());
//! let handle = KernelPeerReconciler::start(FakeKernel::new(), &config, &store, CancellationToken::new()).await?;
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod error;
pub mod fake;
pub mod keys;
#[cfg(feature = "linux")]
pub mod linux;
pub mod reconciler;
pub mod types;

pub use backend::{KernelBackend, PeerTable};
pub use error::{Result, WireGuardError};
pub use fake::{FakeKernel, FakePeerTable};
pub use keys::{KEY_SIZE, PrivateKey, PublicKey, generate_keypair};
#[cfg(feature = "linux")]
pub use linux::{LinuxKernel, LinuxPeerTable};
pub use reconciler::{CHANNEL_CAPACITY, KernelPeerReconciler, PeerEventSender, ReconcilerHandle};
pub use types::{InterfaceConfig, PeerEvent, PeerStatus, host_network};
