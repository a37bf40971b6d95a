//! # tether-punch
//!
//! UDP rendezvous protocol for NAT hole punching.
//!
//! A peer sends any datagram to the server; the server answers with the
//! endpoint it attributes to the sender as ASCII text followed by one NUL byte.
//!
//! - [`RendezvousServer`] - the sequential request/response loop
//! - [`Lookup`] - how a source address becomes an endpoint string
//!   ([`SourceAddrLookup`], [`MeshLookup`], or any async closure)
//! - [`probe`] - the client side

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod lookup;
pub mod probe;
pub mod server;

pub use error::{PunchError, Result};
pub use lookup::{Lookup, MeshLookup, SourceAddrLookup};
pub use probe::{DEFAULT_PROBE_TIMEOUT, decode_response, probe, probe_with_timeout};
pub use server::{DEFAULT_PORT, MAX_RESPONSE_LEN, RendezvousServer, encode_response};
