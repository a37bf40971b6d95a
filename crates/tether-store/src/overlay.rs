//! Overlay address allocation.
//!
//! An overlay address keeps the subnet's prefix bits and randomizes every host
//! bit. The all-zero host address is reserved for the gateway's own interface.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::IpNet;
use rand::Rng;

/// Pick a random address inside `subnet`, excluding its network address.
///
/// Returns `None` when the subnet has no host bits left to randomize.
pub fn random_address<R: Rng + ?Sized>(subnet: &IpNet, rng: &mut R) -> Option<IpAddr> {
    if subnet.prefix_len() >= subnet.max_prefix_len() {
        return None;
    }

    loop {
        let addr = match subnet {
            IpNet::V4(net) => {
                let host_mask = u32::MAX.checked_shr(u32::from(net.prefix_len())).unwrap_or(0);
                let prefix = u32::from(net.network()) & !host_mask;
                IpAddr::V4(Ipv4Addr::from(prefix | (rng.r#gen::<u32>() & host_mask)))
            }
            IpNet::V6(net) => {
                let host_mask = u128::MAX.checked_shr(u32::from(net.prefix_len())).unwrap_or(0);
                let prefix = u128::from(net.network()) & !host_mask;
                IpAddr::V6(Ipv6Addr::from(prefix | (rng.r#gen::<u128>() & host_mask)))
            }
        };

        if addr != subnet.network() {
            return Some(addr);
        }
    }
}
