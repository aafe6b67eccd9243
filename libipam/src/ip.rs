use std::net::{Ipv4Addr, Ipv6Addr};

use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use macaddr::MacAddr6;

use crate::error::IpamError;

pub trait AddIP<N> {
    fn add(self, n: N) -> Self;
}

pub trait SubIP<N> {
    fn sub(self, n: N) -> Self;
}

impl AddIP<u32> for Ipv4Addr {
    fn add(self, n: u32) -> Self {
        Ipv4Addr::from(u32::from(self).wrapping_add(n))
    }
}

impl SubIP<u32> for Ipv4Addr {
    fn sub(self, n: u32) -> Self {
        Ipv4Addr::from(u32::from(self).wrapping_sub(n))
    }
}

impl AddIP<u128> for Ipv6Addr {
    fn add(self, n: u128) -> Self {
        Ipv6Addr::from(self.to_bits().wrapping_add(n))
    }
}

impl SubIP<u128> for Ipv6Addr {
    fn sub(self, n: u128) -> Self {
        Ipv6Addr::from(self.to_bits().wrapping_sub(n))
    }
}

pub fn next_ipv4_network(net: Ipv4Network) -> Result<Ipv4Network, IpamError> {
    let step = 1u64 << (32 - net.prefix());
    let next_ip = (u32::from(net.network()) as u64 + step) as u32;
    Ok(Ipv4Network::new(Ipv4Addr::from(next_ip), net.prefix())?)
}

pub fn next_ipv6_network(net: Ipv6Network) -> Result<Ipv6Network, IpamError> {
    let increment = 1u128.checked_shl(128 - net.prefix() as u32).unwrap_or(0);
    let next = net.network().to_bits().wrapping_add(increment);
    Ok(Ipv6Network::new(Ipv6Addr::from(next), net.prefix())?)
}

/// The `n`th address of `net`, counting the network address as 0.
pub fn nth_ipv4(net: &Ipv4Network, n: u32) -> Option<Ipv4Addr> {
    let host_bits = 32 - net.prefix() as u32;
    if (n as u64) >= 1u64 << host_bits {
        return None;
    }
    Some(net.network().add(n))
}

pub fn nth_ipv6(net: &Ipv6Network, n: u128) -> Option<Ipv6Addr> {
    let host_bits = 128 - net.prefix() as u32;
    if host_bits < 128 && n >> host_bits != 0 {
        return None;
    }
    Some(net.network().add(n))
}

pub(crate) fn bit_width(net: &IpNetwork) -> u32 {
    match net {
        IpNetwork::V4(_) => 32,
        IpNetwork::V6(_) => 128,
    }
}

pub(crate) fn network_bits(net: &IpNetwork) -> u128 {
    match net {
        IpNetwork::V4(n) => u32::from(n.network()) as u128,
        IpNetwork::V6(n) => n.network().to_bits(),
    }
}

/// Whether `outer` contains every address of `inner`.
pub fn contains_network(outer: &IpNetwork, inner: &IpNetwork) -> bool {
    if outer.is_ipv4() != inner.is_ipv4() || outer.prefix() > inner.prefix() {
        return false;
    }
    let shift = bit_width(outer) - outer.prefix() as u32;
    let mask = |bits: u128| bits.checked_shr(shift).unwrap_or(0);
    mask(network_bits(outer)) == mask(network_bits(inner))
}

/// Builds an EUI-64 global address from a /64 prefix and an interface MAC.
pub fn to_global(prefix: &Ipv6Network, mac: MacAddr6) -> Result<Ipv6Addr, IpamError> {
    if prefix.prefix() > 64 {
        return Err(IpamError::NetworkTooSmall(IpNetwork::V6(*prefix)));
    }
    let m = mac.into_array();
    let iid = [m[0] ^ 0x02, m[1], m[2], 0xff, 0xfe, m[3], m[4], m[5]];
    let mut octets = prefix.network().octets();
    octets[8..].copy_from_slice(&iid);
    Ok(Ipv6Addr::from(octets))
}
