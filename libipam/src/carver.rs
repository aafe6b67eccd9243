use std::net::{Ipv4Addr, Ipv6Addr};

use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use log::debug;

use crate::error::IpamError;
use crate::ip::{bit_width, contains_network, network_bits};

/// Smallest subnet handed out from a v6 block.
pub const MIN_IPV6_PREFIX: u8 = 64;

/// One logical network's share of the carved blocks. Either side may be absent
/// when only one address family was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CarvedSubnet {
    pub index: usize,
    pub v4: Option<Ipv4Network>,
    pub v6: Option<Ipv6Network>,
}

/// Splits base blocks into `num_networks` equally sized subnets that do not
/// collide with networks that already exist.
///
/// The carver works on a snapshot of existing networks and takes no lock, so
/// two concurrent carvings over the same block can hand out overlapping
/// subnets. Callers only detect an exact duplicate at insert time.
#[derive(Debug, Clone, Copy)]
pub struct SubnetCarver {
    network_size: u32,
    num_networks: u32,
}

impl SubnetCarver {
    pub fn new(network_size: u32, num_networks: u32) -> Result<Self, IpamError> {
        if network_size == 0 {
            return Err(IpamError::InvalidNetworkSize(network_size));
        }
        Ok(Self {
            network_size,
            num_networks,
        })
    }

    /// `ceil(log2(network_size))`
    pub fn subnet_bits(&self) -> u32 {
        if self.network_size <= 1 {
            0
        } else {
            32 - (self.network_size - 1).leading_zeros()
        }
    }

    pub fn v4_prefix(&self) -> u8 {
        (32 - self.subnet_bits()) as u8
    }

    pub fn v6_prefix(&self) -> u8 {
        ((128 - self.subnet_bits()) as u8).min(MIN_IPV6_PREFIX)
    }

    pub fn carve(
        &self,
        cidr: Option<Ipv4Network>,
        cidr_v6: Option<Ipv6Network>,
        existing: &[IpNetwork],
    ) -> Result<Vec<CarvedSubnet>, IpamError> {
        let v4 = match cidr {
            Some(base) => self.carve_block(IpNetwork::V4(base), self.v4_prefix(), existing)?,
            None => Vec::new(),
        };
        let v6 = match cidr_v6 {
            Some(base) => self.carve_block(IpNetwork::V6(base), self.v6_prefix(), existing)?,
            None => Vec::new(),
        };

        let count = v4.len().max(v6.len());
        let carved = (0..count)
            .map(|index| CarvedSubnet {
                index,
                v4: v4.get(index).and_then(|n| match n {
                    IpNetwork::V4(n) => Some(*n),
                    IpNetwork::V6(_) => None,
                }),
                v6: v6.get(index).and_then(|n| match n {
                    IpNetwork::V6(n) => Some(*n),
                    IpNetwork::V4(_) => None,
                }),
            })
            .collect();
        Ok(carved)
    }

    fn carve_block(
        &self,
        base: IpNetwork,
        prefix: u8,
        existing: &[IpNetwork],
    ) -> Result<Vec<IpNetwork>, IpamError> {
        let insufficient = || IpamError::InsufficientSpace {
            cidr: base,
            prefix,
            requested: self.num_networks,
        };
        if prefix < base.prefix() {
            return Err(insufficient());
        }
        let total = 1u128
            .checked_shl((prefix - base.prefix()) as u32)
            .unwrap_or(u128::MAX);
        if total < self.num_networks as u128 {
            return Err(insufficient());
        }

        let mut candidates: Vec<u128> = (0..self.num_networks as u128).collect();
        for i in 0..candidates.len() {
            let subnet = subnet_at(base, prefix, candidates[i])?;
            let Some(collision) = find_collision(&subnet, existing) else {
                continue;
            };

            let mut next = candidates[i] + 1;
            let replacement = loop {
                if next >= total {
                    break None;
                }
                if !candidates.contains(&next) {
                    let probe = subnet_at(base, prefix, next)?;
                    if find_collision(&probe, existing).is_none() {
                        break Some((next, probe));
                    }
                }
                next += 1;
            };

            match replacement {
                Some((index, probe)) => {
                    debug!("subnet {subnet} is taken, using {probe} instead");
                    candidates[i] = index;
                }
                None => return Err(collision),
            }
        }

        candidates
            .into_iter()
            .map(|index| subnet_at(base, prefix, index))
            .collect()
    }
}

fn subnet_at(base: IpNetwork, prefix: u8, index: u128) -> Result<IpNetwork, IpamError> {
    let step = 1u128
        .checked_shl(bit_width(&base) - prefix as u32)
        .unwrap_or(0);
    let start = network_bits(&base).wrapping_add(index.wrapping_mul(step));
    let net = match base {
        IpNetwork::V4(_) => IpNetwork::V4(Ipv4Network::new(Ipv4Addr::from(start as u32), prefix)?),
        IpNetwork::V6(_) => IpNetwork::V6(Ipv6Network::new(Ipv6Addr::from(start), prefix)?),
    };
    Ok(net)
}

fn find_collision(subnet: &IpNetwork, existing: &[IpNetwork]) -> Option<IpamError> {
    for used in existing.iter().filter(|n| n.is_ipv4() == subnet.is_ipv4()) {
        if used.prefix() == subnet.prefix() && contains_network(used, subnet) {
            return Some(IpamError::CidrInUse(*subnet));
        }
        if contains_network(used, subnet) {
            return Some(IpamError::ConflictsWithSupernet {
                cidr: *subnet,
                supernet: *used,
            });
        }
        if contains_network(subnet, used) {
            return Some(IpamError::ConflictsWithSmaller {
                cidr: *subnet,
                smaller: *used,
            });
        }
    }
    None
}
