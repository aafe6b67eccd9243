use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use chrono::{DateTime, Utc};
use ipnetwork::{Ipv4Network, Ipv6Network};
use serde::{Deserialize, Serialize};

/// A tenant network carved out of the configured address blocks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Network {
    pub id: i64,
    pub uuid: String,
    pub label: String,
    pub cidr: Option<Ipv4Network>,
    pub cidr_v6: Option<Ipv6Network>,
    pub netmask: Option<Ipv4Addr>,
    pub broadcast: Option<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
    pub gateway_v6: Option<Ipv6Addr>,
    pub netmask_v6: Option<Ipv6Addr>,
    pub bridge: Option<String>,
    pub bridge_interface: Option<String>,
    pub vlan: Option<u16>,
    /// Owning network host. Unset until a host is elected.
    pub host: Option<String>,
    pub multi_host: bool,
    /// Unset while the network is not allocated to a tenant.
    pub project_id: Option<String>,
    pub dhcp_start: Option<Ipv4Addr>,
    pub vpn_public_address: Option<Ipv4Addr>,
    pub vpn_public_port: Option<u16>,
    pub vpn_private_address: Option<Ipv4Addr>,
    pub dns1: Option<IpAddr>,
    pub dns2: Option<IpAddr>,
    pub rxtx_base: Option<u32>,
    pub injected: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Network {
    /// Blank row with a fresh uuid. `id` is assigned by the store on insert.
    pub fn new(label: impl Into<String>) -> Self {
        Network {
            id: 0,
            uuid: uuid::Uuid::new_v4().to_string(),
            label: label.into(),
            cidr: None,
            cidr_v6: None,
            netmask: None,
            broadcast: None,
            gateway: None,
            gateway_v6: None,
            netmask_v6: None,
            bridge: None,
            bridge_interface: None,
            vlan: None,
            host: None,
            multi_host: false,
            project_id: None,
            dhcp_start: None,
            vpn_public_address: None,
            vpn_public_port: None,
            vpn_private_address: None,
            dns1: None,
            dns2: None,
            rxtx_base: None,
            injected: false,
            created_at: Utc::now(),
            updated_at: None,
        }
    }
}

/// One address of a network's v4 block.
///
/// `allocated == false && leased == false` means the address is back in the
/// free pool and may be disassociated from its instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FixedIp {
    pub id: i64,
    pub address: Ipv4Addr,
    pub network_id: i64,
    pub instance_uuid: Option<String>,
    pub virtual_interface_id: Option<i64>,
    pub allocated: bool,
    pub leased: bool,
    pub reserved: bool,
    /// Set when the address is claimed as a host's DHCP server address.
    pub host: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl FixedIp {
    pub fn new(address: Ipv4Addr, network_id: i64, reserved: bool) -> Self {
        FixedIp {
            id: 0,
            address,
            network_id,
            instance_uuid: None,
            virtual_interface_id: None,
            allocated: false,
            leased: false,
            reserved,
            host: None,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    pub fn is_free(&self) -> bool {
        self.instance_uuid.is_none() && !self.reserved && self.host.is_none()
    }
}

/// Link between an instance and a network, identified by a MAC address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VirtualInterface {
    pub id: i64,
    pub uuid: String,
    pub address: String,
    pub instance_uuid: String,
    pub network_id: i64,
}

/// Publicly routable address mapped on top of a fixed IP.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FloatingIp {
    pub address: Ipv4Addr,
    pub fixed_address: Option<Ipv4Addr>,
    pub project_id: Option<String>,
    pub host: Option<String>,
}

/// Scope of an instance DNS domain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DnsDomain {
    pub domain: String,
    pub availability_zone: Option<String>,
    pub project_id: Option<String>,
}

/// A network (and optionally a specific address on it) asked for by the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestedNetwork {
    pub network_uuid: String,
    pub address: Option<Ipv4Addr>,
}
