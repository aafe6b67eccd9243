use std::net::Ipv4Addr;

use ipnetwork::{IpNetwork, Ipv4Network};
use serde::{Deserialize, Serialize};

use crate::error::IpamError;
use crate::ip::nth_ipv4;

/// Number of infrastructure addresses held back at each end of a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservedIps {
    pub bottom: u32,
    pub top: u32,
}

impl ReservedIps {
    /// Network address and gateway below, broadcast above.
    pub const BASE: ReservedIps = ReservedIps { bottom: 2, top: 1 };

    pub const fn new(bottom: u32, top: u32) -> Self {
        ReservedIps { bottom, top }
    }

    pub fn total(&self) -> u32 {
        self.bottom + self.top
    }

    /// Whether the `index`th of `num_ips` addresses is held back.
    pub fn is_reserved(&self, index: u32, num_ips: u32) -> bool {
        index < self.bottom || num_ips - index <= self.top
    }
}

/// A single address of a fixed-IP pool and whether it may be handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolEntry {
    pub address: Ipv4Addr,
    pub reserved: bool,
}

/// Lays out every address of `cidr` with the reserved ones marked.
pub fn fixed_ip_pool(cidr: &Ipv4Network, reserved: ReservedIps) -> Vec<PoolEntry> {
    let num_ips = 1u64 << (32 - cidr.prefix() as u32);
    let num_ips = num_ips.min(u32::MAX as u64) as u32;
    (0..num_ips)
        .filter_map(|index| {
            nth_ipv4(cidr, index).map(|address| PoolEntry {
                address,
                reserved: reserved.is_reserved(index, num_ips),
            })
        })
        .collect()
}

/// Rejects blocks that cannot hold the reserved addresses plus at least one
/// allocatable address, or that are not written on a network boundary.
pub fn validate_block(cidr: &Ipv4Network, reserved: ReservedIps) -> Result<(), IpamError> {
    if cidr.ip() != cidr.network() {
        return Err(IpamError::HostBitsSet(IpNetwork::V4(*cidr)));
    }
    let num_ips = 1u64 << (32 - cidr.prefix() as u32);
    if num_ips <= reserved.total() as u64 {
        return Err(IpamError::NetworkTooSmall(IpNetwork::V4(*cidr)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_pool_layout() {
        let cidr: Ipv4Network = "10.0.0.0/24".parse().unwrap();
        let pool = fixed_ip_pool(&cidr, ReservedIps::BASE);
        assert_eq!(pool.len(), 256);
        assert!(pool[0].reserved);
        assert!(pool[1].reserved);
        assert!(!pool[2].reserved);
        assert!(!pool[254].reserved);
        assert!(pool[255].reserved);
        assert_eq!(pool.iter().filter(|p| p.reserved).count(), 3);
        assert_eq!(pool[2].address, Ipv4Addr::new(10, 0, 0, 2));
    }

    #[test]
    fn test_vlan_pool_layout() {
        let cidr: Ipv4Network = "10.0.1.0/25".parse().unwrap();
        let reserved = ReservedIps::new(3, 1 + 4);
        let pool = fixed_ip_pool(&cidr, reserved);
        assert_eq!(pool.len(), 128);
        assert_eq!(pool.iter().filter(|p| p.reserved).count(), 8);
        assert!(pool[2].reserved);
        assert!(!pool[3].reserved);
        assert!(pool[123].reserved);
        assert!(!pool[122].reserved);
    }

    #[test]
    fn test_validate_block() {
        assert!(validate_block(&"10.0.0.0/24".parse().unwrap(), ReservedIps::BASE).is_ok());
        assert!(matches!(
            validate_block(&"10.0.0.5/24".parse().unwrap(), ReservedIps::BASE),
            Err(IpamError::HostBitsSet(_))
        ));
        assert!(matches!(
            validate_block(&"10.0.0.0/31".parse().unwrap(), ReservedIps::BASE),
            Err(IpamError::NetworkTooSmall(_))
        ));
    }

    #[test]
    fn test_reserved_serializes() {
        let json = serde_json::to_string(&ReservedIps::BASE).unwrap();
        assert_eq!(json, r#"{"bottom":2,"top":1}"#);
    }
}
