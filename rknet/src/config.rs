use std::collections::HashMap;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use anyhow::{Context, Result, bail};
use ipnetwork::{Ipv4Network, Ipv6Network};
use serde::Deserialize;

use crate::topology::TopologyKind;

#[derive(Debug, Deserialize)]
pub struct Config {
    // ip:port of the RPC endpoint
    pub addr: String,
    // name other hosts use to reach this one, must be a key of `peers`
    pub host: String,
    #[serde(default)]
    pub topology: TopologyKind,
    // Xline endpoints. The in-memory store is used when absent.
    #[serde(default)]
    pub xline_config: Option<XlineConfig>,
    #[serde(default)]
    pub peers: HashMap<String, String>,
    #[serde(default)]
    pub network: NetworkConfig,
}

impl Config {
    pub fn peer_addrs(&self) -> Result<HashMap<String, SocketAddr>> {
        self.peers
            .iter()
            .map(|(host, addr)| {
                let addr = addr
                    .parse()
                    .with_context(|| format!("invalid address {addr} for peer {host}"))?;
                Ok((host.clone(), addr))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct XlineConfig {
    pub endpoints: Vec<String>,
    pub prefix: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Deployment-wide defaults for network creation and allocation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub flat_network_bridge: Option<String>,
    pub flat_network_dns: IpAddr,
    pub flat_injected: bool,
    pub flat_interface: Option<String>,
    pub vlan_start: u16,
    pub vlan_interface: Option<String>,
    pub num_networks: u32,
    pub vpn_ip: Option<Ipv4Addr>,
    pub vpn_start: u16,
    pub network_size: u32,
    pub fixed_range: Ipv4Network,
    pub fixed_range_v6: Ipv6Network,
    pub gateway: Option<Ipv4Addr>,
    pub gateway_v6: Option<Ipv6Addr>,
    pub cnt_vpn_clients: u32,
    /// Seconds after which an unallocated fixed ip is disassociated.
    pub fixed_ip_disassociate_timeout: u64,
    pub create_unique_mac_address_attempts: u32,
    pub multi_host: bool,
    pub force_dhcp_release: bool,
    pub share_dhcp_address: bool,
    pub update_dns_entries: bool,
    pub teardown_unused_network_gateway: bool,
    pub dhcp_domain: String,
    pub instance_dns_domain: Option<String>,
    pub use_ipv6: bool,
    pub fake_network: bool,
    /// Seconds between DNS refreshes, disabled when not positive.
    pub dns_update_periodic_interval: i64,
    pub fixed_ip_reclaim_interval: u64,
    pub max_concurrent_allocations: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            flat_network_bridge: None,
            flat_network_dns: IpAddr::V4(Ipv4Addr::new(8, 8, 4, 4)),
            flat_injected: false,
            flat_interface: None,
            vlan_start: 100,
            vlan_interface: None,
            num_networks: 1,
            vpn_ip: None,
            vpn_start: 1000,
            network_size: 256,
            fixed_range: Ipv4Network::new(Ipv4Addr::new(10, 0, 0, 0), 8)
                .unwrap_or_else(|_| Ipv4Network::from(Ipv4Addr::UNSPECIFIED)),
            fixed_range_v6: Ipv6Network::new(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 0), 48)
                .unwrap_or_else(|_| Ipv6Network::from(Ipv6Addr::UNSPECIFIED)),
            gateway: None,
            gateway_v6: None,
            cnt_vpn_clients: 0,
            fixed_ip_disassociate_timeout: 600,
            create_unique_mac_address_attempts: 5,
            multi_host: false,
            force_dhcp_release: false,
            share_dhcp_address: false,
            update_dns_entries: false,
            teardown_unused_network_gateway: false,
            dhcp_domain: "novalocal".to_string(),
            instance_dns_domain: None,
            use_ipv6: false,
            fake_network: false,
            dns_update_periodic_interval: -1,
            fixed_ip_reclaim_interval: 60,
            max_concurrent_allocations: 16,
        }
    }
}

pub fn check_network_config(cfg: &NetworkConfig) -> Result<()> {
    if cfg.vlan_start == 0 || cfg.vlan_start > 4094 {
        bail!("vlan_start must be between 1 and 4094");
    }
    if cfg.num_networks == 0 {
        bail!("num_networks must be at least 1");
    }
    if cfg.network_size < 4 {
        bail!("network_size must be at least 4");
    }
    if cfg.create_unique_mac_address_attempts == 0 {
        bail!("create_unique_mac_address_attempts must be at least 1");
    }
    if cfg.max_concurrent_allocations == 0 {
        bail!("max_concurrent_allocations must be at least 1");
    }
    if cfg.fixed_ip_reclaim_interval == 0 {
        bail!("fixed_ip_reclaim_interval must be at least 1 second");
    }
    Ok(())
}

pub fn load_config(path: &str) -> Result<Config> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read config from {path}"))?;
    let cfg: Config = serde_yaml::from_str(&content).context("Failed to parse YAML config")?;
    check_network_config(&cfg.network)?;
    Ok(cfg)
}
