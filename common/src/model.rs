use std::net::{IpAddr, Ipv4Addr};

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Route {
    pub cidr: IpNetwork,
    pub gateway: IpAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FixedIpModel {
    pub address: IpAddr,
    pub floating_ips: Vec<Ipv4Addr>,
}

impl FixedIpModel {
    pub fn version(&self) -> u8 {
        if self.address.is_ipv4() { 4 } else { 6 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubnetModel {
    pub cidr: IpNetwork,
    pub gateway: Option<IpAddr>,
    pub dns: Vec<IpAddr>,
    pub routes: Vec<Route>,
    pub ips: Vec<FixedIpModel>,
    /// Present only for topologies that run DHCP.
    pub dhcp_server: Option<Ipv4Addr>,
}

impl SubnetModel {
    pub fn version(&self) -> u8 {
        if self.cidr.is_ipv4() { 4 } else { 6 }
    }
}

/// Public view of a network. The optional fields are filled per topology.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NetworkModel {
    pub id: String,
    pub bridge: Option<String>,
    pub label: String,
    pub tenant_id: Option<String>,
    pub injected: Option<bool>,
    pub should_create_bridge: Option<bool>,
    pub should_create_vlan: Option<bool>,
    pub bridge_interface: Option<String>,
    pub multi_host: Option<bool>,
    pub vlan: Option<u16>,
    pub subnets: Vec<SubnetModel>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VifModel {
    pub id: String,
    pub address: String,
    /// Absent when the interface's network could not be resolved.
    pub network: Option<NetworkModel>,
    pub rxtx_cap: Option<f64>,
}

impl VifModel {
    pub fn fixed_ips(&self) -> impl Iterator<Item = &FixedIpModel> {
        self.network
            .iter()
            .flat_map(|n| n.subnets.iter())
            .flat_map(|s| s.ips.iter())
    }
}

/// Everything an instance needs to know about its network attachments.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NetworkInfo(pub Vec<VifModel>);

impl NetworkInfo {
    pub fn vifs(&self) -> &[VifModel] {
        &self.0
    }

    pub fn fixed_ips(&self) -> Vec<&FixedIpModel> {
        self.0.iter().flat_map(|v| v.fixed_ips()).collect()
    }
}
