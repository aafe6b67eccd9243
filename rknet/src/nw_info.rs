use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use common::{
    FixedIpModel, Network, NetworkInfo, NetworkModel, Route, SubnetModel, VifModel,
    VirtualInterface,
};
use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use libipam::ip::to_global;
use libipam::mac::parse_mac;
use log::warn;

use crate::Result;
use crate::topology::NetworkTopology;
use crate::topology::dhcp::get_dhcp_ip;

fn default_route_v4(gateway: Ipv4Addr) -> Option<Route> {
    let cidr = Ipv4Network::new(Ipv4Addr::UNSPECIFIED, 0).ok()?;
    Some(Route {
        cidr: IpNetwork::V4(cidr),
        gateway: IpAddr::V4(gateway),
    })
}

fn default_route_v6(gateway: Ipv6Addr) -> Option<Route> {
    let cidr = Ipv6Network::new(Ipv6Addr::UNSPECIFIED, 0).ok()?;
    Some(Route {
        cidr: IpNetwork::V6(cidr),
        gateway: IpAddr::V6(gateway),
    })
}

/// Assembles the network view of an instance from its interfaces.
pub struct NetworkInfoBuilder<'a> {
    topology: &'a dyn NetworkTopology,
}

impl<'a> NetworkInfoBuilder<'a> {
    pub fn new(topology: &'a dyn NetworkTopology) -> Self {
        Self { topology }
    }

    pub async fn build(
        &self,
        vifs: &[VirtualInterface],
        networks: &HashMap<i64, Network>,
        rxtx_factor: Option<f64>,
        instance_host: Option<&str>,
    ) -> Result<NetworkInfo> {
        let mut info = Vec::with_capacity(vifs.len());
        for vif in vifs {
            let Some(network) = networks.get(&vif.network_id) else {
                info.push(VifModel {
                    id: vif.uuid.clone(),
                    address: vif.address.clone(),
                    network: None,
                    rxtx_cap: None,
                });
                continue;
            };
            let subnets = self.subnets(network, vif, instance_host).await?;
            let rxtx_cap = match (network.rxtx_base, rxtx_factor) {
                (Some(base), Some(factor)) => Some(base as f64 * factor),
                _ => None,
            };
            info.push(VifModel {
                id: vif.uuid.clone(),
                address: vif.address.clone(),
                network: Some(NetworkModel {
                    subnets,
                    ..self.topology.network_dict(network)
                }),
                rxtx_cap,
            });
        }
        Ok(NetworkInfo(info))
    }

    async fn subnets(
        &self,
        network: &Network,
        vif: &VirtualInterface,
        instance_host: Option<&str>,
    ) -> Result<Vec<SubnetModel>> {
        let ctx = self.topology.context();
        let mut subnets = Vec::with_capacity(2);

        if let Some(cidr) = network.cidr {
            let mut ips = Vec::new();
            for fixed_ip in ctx.store.fixed_ips_by_virtual_interface(vif.id).await? {
                let floating_ips = self
                    .topology
                    .floating_ips_by_fixed_address(fixed_ip.address)
                    .await?
                    .into_iter()
                    .map(|f| f.address)
                    .collect();
                ips.push(FixedIpModel {
                    address: IpAddr::V4(fixed_ip.address),
                    floating_ips,
                });
            }
            let dhcp_server = if self.topology.uses_dhcp() {
                let host = instance_host.unwrap_or(&ctx.host);
                Some(get_dhcp_ip(ctx, network, host).await?)
            } else {
                None
            };
            subnets.push(SubnetModel {
                cidr: IpNetwork::V4(cidr),
                gateway: network.gateway.map(IpAddr::V4),
                dns: network.dns1.into_iter().chain(network.dns2).collect(),
                routes: network.gateway.and_then(default_route_v4).into_iter().collect(),
                ips,
                dhcp_server,
            });
        }

        if let Some(cidr_v6) = network.cidr_v6 {
            let ips = match parse_mac(&vif.address).and_then(|mac| to_global(&cidr_v6, mac)) {
                Ok(address) => vec![FixedIpModel {
                    address: IpAddr::V6(address),
                    floating_ips: Vec::new(),
                }],
                Err(e) => {
                    warn!("no v6 address for vif {}: {e}", vif.uuid);
                    Vec::new()
                }
            };
            subnets.push(SubnetModel {
                cidr: IpNetwork::V6(cidr_v6),
                gateway: network.gateway_v6.map(IpAddr::V6),
                dns: Vec::new(),
                routes: network.gateway_v6.and_then(default_route_v6).into_iter().collect(),
                ips,
                dhcp_server: None,
            });
        }
        Ok(subnets)
    }
}
