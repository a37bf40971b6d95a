//! # tether-gateway
//!
//! Live peer connections and topology-change fan-out for Tether.
//!
//! - [`ConnectionRegistry`] - every live connection and its bound device
//! - [`NotificationEngine`] - decides which peers must hear about a change
//! - [`DeliveryPool`] - bounded, per-device ordered queue plus the only writers
//! - [`accept_gateway_connection`] - the session loop for one authenticated peer
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use ipnet::IpNet;
//! use tether_gateway::{ConnectionRegistry, DeliveryPool, GatewayContext, NotificationEngine};
//! use tether_store::{MemoryStore, Store};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let subnet: IpNet = "fd00::/32".parse()?;
//! let store: Arc<dyn Store> = Arc::new(MemoryStore::new(subnet));
//! let registry = Arc::new(ConnectionRegistry::new());
//! let pool = DeliveryPool::start(Arc::clone(&registry), 4, 4096);
//! let engine = NotificationEngine::new(Arc::clone(&store), pool.clone());
//! let ctx = GatewayContext::new(registry, store, engine);
//!
//! // hand `ctx.clone()` to `accept_gateway_connection` for every peer...
//! # drop(ctx);
//! pool.stop().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod connection;
pub mod delivery;
pub mod error;
pub mod notify;
pub mod registry;
pub mod session;

pub use connection::{GatewayConnection, MessageSink, websocket_sink};
pub use delivery::{DEFAULT_QUEUE_CAPACITY, DeliveryConfig, DeliveryPool, SEND_TIMEOUT, SendRequest};
pub use error::{GatewayError, Result};
pub use notify::NotificationEngine;
pub use registry::ConnectionRegistry;
pub use session::{GatewayContext, accept_gateway_connection};
