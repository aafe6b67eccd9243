//! Network creation: argument defaults and validation, subnet carving and
//! the bulk insert of each network's fixed-IP pool.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use common::{FixedIp, Network};
use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use libipam::ip::{nth_ipv4, nth_ipv6};
use libipam::range::{fixed_ip_pool, validate_block};
use libipam::SubnetCarver;
use log::{info, warn};

use crate::topology::{NetworkTopology, TopologyKind};
use crate::{NetworkError, Result};

const MAX_LABEL_LEN: usize = 255;
const MAX_VLAN: u32 = 4094;

/// Arguments of a network creation. Unset fields take the configured
/// defaults.
#[derive(Debug, Clone, Default)]
pub struct CreateNetworkRequest {
    pub label: String,
    pub cidr: Option<Ipv4Network>,
    pub cidr_v6: Option<Ipv6Network>,
    pub multi_host: Option<bool>,
    pub num_networks: Option<u32>,
    pub network_size: Option<u32>,
    pub gateway: Option<Ipv4Addr>,
    pub gateway_v6: Option<Ipv6Addr>,
    pub bridge: Option<String>,
    pub bridge_interface: Option<String>,
    pub dns1: Option<IpAddr>,
    pub dns2: Option<IpAddr>,
    /// Sub-block of the v4 cidr whose addresses become fixed ips.
    pub fixed_cidr: Option<Ipv4Network>,
    pub vlan_start: Option<u16>,
    pub vpn_start: Option<u16>,
    pub project_id: Option<String>,
    pub rxtx_base: Option<u32>,
}

fn block_size(cidr: &Ipv4Network) -> u64 {
    1u64 << (32 - cidr.prefix() as u32)
}

/// Request with every default resolved.
#[derive(Debug)]
struct Resolved {
    req: CreateNetworkRequest,
    num_networks: u32,
    network_size: u32,
    multi_host: bool,
    vlan_start: u16,
    vpn_start: u16,
}

fn resolve(topology: &dyn NetworkTopology, mut req: CreateNetworkRequest) -> Result<Resolved> {
    let cfg = &topology.context().config;

    if req.label.is_empty() {
        return Err(NetworkError::InvalidInput("label must not be empty".to_string()));
    }
    if req.label.chars().count() > MAX_LABEL_LEN {
        return Err(NetworkError::InvalidInput(format!(
            "label must be at most {MAX_LABEL_LEN} characters"
        )));
    }
    if req.cidr.is_none() && req.cidr_v6.is_none() {
        return Err(NetworkError::NetworkNotCreated("cidr or cidr_v6"));
    }

    if req.cidr_v6.is_none() && cfg.use_ipv6 {
        req.cidr_v6 = Some(cfg.fixed_range_v6);
    }
    req.bridge = req.bridge.or_else(|| cfg.flat_network_bridge.clone());
    req.bridge_interface = req.bridge_interface.or_else(|| match topology.kind() {
        TopologyKind::Vlan => cfg.vlan_interface.clone(),
        _ => cfg.flat_interface.clone(),
    });
    for arg in topology.required_create_args() {
        let present = match *arg {
            "bridge" => req.bridge.is_some(),
            "bridge_interface" => req.bridge_interface.is_some(),
            _ => true,
        };
        if !present {
            return Err(NetworkError::NetworkNotCreated(arg));
        }
    }

    let num_networks = req.num_networks.unwrap_or(cfg.num_networks);
    if num_networks == 0 {
        return Err(NetworkError::InvalidInput("num_networks must be at least 1".to_string()));
    }
    let network_size = match (req.network_size, req.cidr) {
        (Some(size), _) => size,
        (None, Some(cidr)) => {
            let each = (block_size(&cidr) / num_networks as u64).min(u32::MAX as u64) as u32;
            if each > cfg.network_size {
                warn!(
                    "subnet(s) too large, defaulting to a size of {}; set network_size to override",
                    cfg.network_size
                );
                cfg.network_size
            } else {
                each
            }
        }
        (None, None) => cfg.network_size,
    };
    if network_size < 4 {
        return Err(NetworkError::InvalidInput(format!(
            "network_size {network_size} must be at least 4"
        )));
    }
    let vlan_start = req.vlan_start.unwrap_or(cfg.vlan_start);
    let vpn_start = req.vpn_start.unwrap_or(cfg.vpn_start);
    if vlan_start == 0 {
        return Err(NetworkError::InvalidInput("vlan_start must be at least 1".to_string()));
    }
    if vpn_start == 0 {
        return Err(NetworkError::InvalidInput("vpn_start must be at least 1".to_string()));
    }
    req.dns1 = req.dns1.or(Some(cfg.flat_network_dns));
    let multi_host = req.multi_host.unwrap_or(cfg.multi_host);

    if topology.kind() == TopologyKind::Vlan {
        if num_networks + vlan_start as u32 > MAX_VLAN {
            return Err(NetworkError::InvalidInput(format!(
                "the sum of num_networks and vlan_start cannot exceed {MAX_VLAN}"
            )));
        }
        if num_networks + vpn_start as u32 > u16::MAX as u32 {
            return Err(NetworkError::InvalidInput(
                "vpn ports would exceed the port range".to_string(),
            ));
        }
        let Some(cidr) = req.cidr else {
            return Err(NetworkError::NetworkNotCreated("cidr"));
        };
        if block_size(&cidr) < num_networks as u64 * network_size as u64 {
            return Err(NetworkError::InvalidInput(format!(
                "the network range is not big enough to fit {num_networks} networks of size {network_size}"
            )));
        }
    }

    Ok(Resolved {
        req,
        num_networks,
        network_size,
        multi_host,
        vlan_start,
        vpn_start,
    })
}

/// Creates `num_networks` networks carved from the requested blocks and the
/// fixed ips of each. Fails without writing when carving fails; a carved
/// cidr that was created concurrently fails with `NetworkAlreadyExists`.
pub async fn create_networks(
    topology: &dyn NetworkTopology,
    req: CreateNetworkRequest,
) -> Result<Vec<Network>> {
    let r = resolve(topology, req)?;
    let store = &topology.context().store;
    let reserved = topology.reserved_ips();
    let vlan = topology.kind() == TopologyKind::Vlan;
    let cfg = &topology.context().config;

    let existing: Vec<IpNetwork> = store
        .network_get_all()
        .await?
        .iter()
        .flat_map(|n| {
            n.cidr
                .map(IpNetwork::V4)
                .into_iter()
                .chain(n.cidr_v6.map(IpNetwork::V6))
        })
        .collect();
    let carver = SubnetCarver::new(r.network_size, r.num_networks)?;
    let carved = carver.carve(r.req.cidr, r.req.cidr_v6, &existing)?;
    for subnet in carved.iter().filter_map(|c| c.v4) {
        validate_block(&subnet, reserved)?;
    }

    let mut networks = Vec::with_capacity(carved.len());
    for c in carved {
        let mut net = Network::new(if r.num_networks > 1 {
            format!("{}_{}", r.req.label, c.index)
        } else {
            r.req.label.clone()
        });
        net.bridge = r.req.bridge.clone();
        net.bridge_interface = r.req.bridge_interface.clone();
        net.multi_host = r.multi_host;
        net.dns1 = r.req.dns1;
        net.dns2 = r.req.dns2;
        net.project_id = r.req.project_id.clone();
        net.rxtx_base = r.req.rxtx_base;

        if let Some(v4) = c.v4 {
            net.cidr = Some(v4);
            net.netmask = Some(v4.mask());
            net.gateway = r
                .req
                .gateway
                .or(cfg.gateway.filter(|g| v4.contains(*g)))
                .or_else(|| nth_ipv4(&v4, 1));
            net.broadcast = Some(v4.broadcast());
            net.dhcp_start = nth_ipv4(&v4, 2);
        }
        if let Some(v6) = c.v6 {
            net.cidr_v6 = Some(v6);
            net.gateway_v6 = r
                .req
                .gateway_v6
                .or(cfg.gateway_v6.filter(|g| v6.contains(*g)))
                .or_else(|| nth_ipv6(&v6, 1));
            net.netmask_v6 = Some(v6.mask());
        }
        if vlan {
            let vlan_id = r.vlan_start + c.index as u16;
            net.vlan = Some(vlan_id);
            net.bridge = Some(format!("br{vlan_id}"));
            net.vpn_public_port = Some(r.vpn_start + c.index as u16);
            if let Some(v4) = c.v4 {
                net.vpn_private_address = nth_ipv4(&v4, 2);
                net.dhcp_start = nth_ipv4(&v4, 3);
            }
        }

        let label = net.label.clone();
        let network = store
            .network_create_safe(net)
            .await?
            .ok_or(NetworkError::NetworkAlreadyExists(label))?;

        if let Some(v4) = network.cidr {
            let block = r.req.fixed_cidr.unwrap_or(v4);
            let ips: Vec<FixedIp> = fixed_ip_pool(&block, reserved)
                .into_iter()
                .map(|e| FixedIp::new(e.address, network.id, e.reserved))
                .collect();
            store.fixed_ip_bulk_create(ips).await?;
        }
        info!(
            "created network {} ({}) cidr={:?} cidr_v6={:?}",
            network.label, network.uuid, network.cidr, network.cidr_v6
        );
        networks.push(network);
    }
    Ok(networks)
}
