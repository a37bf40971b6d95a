//! # tether-server
//!
//! The `tetherd` daemon: configuration, gateway authentication, the WebSocket
//! listener, and the wiring between the Tether components.
//!
//! ## Architecture
//!
//! ```text
//!  peers (WebSocket)          peers (UDP probe)
//!        │                          │
//! ┌──────▼────────┐        ┌────────▼─────────┐
//! │ GatewayServer │        │ RendezvousServer │
//! └──────┬────────┘        └────────▲─────────┘
//!        │ pings                    │ peer table (read-only)
//! ┌──────▼──────────────┐  ┌────────┴─────────────┐
//! │ NotificationEngine  │  │ KernelPeerReconciler │
//! └──────┬──────────────┘  └──────────────────────┘
//!        │ send requests
//! ┌──────▼──────────────┐
//! │ DeliveryPool        │──► ConnectionRegistry ──► peers
//! └─────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use tether_server::{Daemon, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::from_file("/etc/tether/tetherd.toml")?;
//!     let daemon = Daemon::start(&config).await?;
//!     tokio::signal::ctrl_c().await?;
//!     daemon.shutdown().await;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod config;
pub mod daemon;
pub mod error;
pub mod server;

pub use auth::{Authenticator, StaticTokenAuthenticator, bearer_token};
pub use config::{DeliverySection, KernelSection, RendezvousSection, ServerConfig};
pub use daemon::Daemon;
pub use error::{ServerError, ServerResult};
pub use server::{GatewayServer, HANDSHAKE_TIMEOUT};
