//! Contracts of the host-side collaborators: the DHCP/bridge device driver,
//! the L3 gateway driver, instance DNS and security groups.
//!
//! Device manipulation itself lives outside this crate. The implementations
//! here only log, which is what a host without a device backend runs.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};

use anyhow::{Result, bail};
use async_trait::async_trait;
use common::{Instance, Network};
use ipnetwork::Ipv4Network;
use log::{debug, info};
use tokio::sync::Mutex;

/// One allocated address as the DHCP server sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpHost {
    pub mac: String,
    pub address: Ipv4Addr,
    /// Qualified with the configured DHCP domain.
    pub hostname: String,
}

#[async_trait]
pub trait DeviceDriver: Send + Sync {
    /// Name of the bridge device serving the network.
    async fn get_dev(&self, network: &Network) -> Result<String>;

    async fn update_dhcp(&self, dev: &str, network: &Network, dhcp_server: Ipv4Addr) -> Result<()>;

    async fn update_dns(&self, dev: &str, network: &Network) -> Result<()>;

    async fn update_ra(&self, dev: &str, network: &Network) -> Result<()>;

    async fn release_dhcp(&self, dev: &str, address: Ipv4Addr, mac: &str) -> Result<()>;

    async fn kill_dhcp(&self, dev: &str) -> Result<()>;

    /// Renders the lease file of the network from its allocated hosts.
    async fn get_dhcp_leases(&self, network: &Network, hosts: &[DhcpHost]) -> Result<String>;

    async fn link_local_address(&self, dev: &str) -> Result<Ipv6Addr>;
}

#[async_trait]
pub trait L3Driver: Send + Sync {
    async fn initialize(&self, fixed_range: Option<Ipv4Network>, networks: &[Network]) -> Result<()>;

    async fn initialize_gateway(&self, network: &Network, dhcp_server: Ipv4Addr) -> Result<()>;

    async fn add_vpn(&self, public_ip: Ipv4Addr, port: u16, private_ip: Ipv4Addr) -> Result<()>;

    async fn remove_gateway(&self, network: &Network) -> Result<()>;
}

#[async_trait]
pub trait DnsManager: Send + Sync {
    /// `record_type` is the DNS record type, `A` for instance addresses.
    async fn create_entry(&self, name: &str, address: Ipv4Addr, record_type: &str, domain: &str) -> Result<()>;

    async fn delete_entry(&self, name: &str, domain: &str) -> Result<()>;

    async fn get_entries_by_address(&self, address: Ipv4Addr, domain: &str) -> Result<Vec<String>>;
}

#[async_trait]
pub trait SecurityGroupApi: Send + Sync {
    async fn trigger_members_refresh(&self, groups: &[String]) -> Result<()>;

    /// `handler` is `instance_add_security_group` or
    /// `instance_remove_security_group`.
    async fn trigger_handler(&self, handler: &str, instance: &Instance, group: &str) -> Result<()>;
}

/// Device driver for hosts without a DHCP/bridge backend.
#[derive(Debug, Default)]
pub struct LoggingDeviceDriver;

#[async_trait]
impl DeviceDriver for LoggingDeviceDriver {
    async fn get_dev(&self, network: &Network) -> Result<String> {
        Ok(network
            .bridge
            .clone()
            .unwrap_or_else(|| format!("br{}", network.id)))
    }

    async fn update_dhcp(&self, dev: &str, network: &Network, dhcp_server: Ipv4Addr) -> Result<()> {
        info!("dhcp on {dev} for network {} served from {dhcp_server}", network.uuid);
        Ok(())
    }

    async fn update_dns(&self, dev: &str, network: &Network) -> Result<()> {
        info!("refresh dns hosts on {dev} for network {}", network.uuid);
        Ok(())
    }

    async fn update_ra(&self, dev: &str, network: &Network) -> Result<()> {
        info!("router advertisement on {dev} for {:?}", network.cidr_v6);
        Ok(())
    }

    async fn release_dhcp(&self, dev: &str, address: Ipv4Addr, mac: &str) -> Result<()> {
        info!("release dhcp lease {address} ({mac}) on {dev}");
        Ok(())
    }

    async fn kill_dhcp(&self, dev: &str) -> Result<()> {
        info!("stop dhcp on {dev}");
        Ok(())
    }

    async fn get_dhcp_leases(&self, network: &Network, hosts: &[DhcpHost]) -> Result<String> {
        debug!("{} leases on network {}", hosts.len(), network.uuid);
        let expiry = chrono::Utc::now().timestamp();
        Ok(hosts
            .iter()
            .map(|h| format!("{expiry} {} {} {} *\n", h.mac, h.address, h.hostname))
            .collect())
    }

    async fn link_local_address(&self, _dev: &str) -> Result<Ipv6Addr> {
        Ok(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1))
    }
}

#[derive(Debug, Default)]
pub struct LoggingL3Driver;

#[async_trait]
impl L3Driver for LoggingL3Driver {
    async fn initialize(&self, fixed_range: Option<Ipv4Network>, networks: &[Network]) -> Result<()> {
        info!("l3 init for {fixed_range:?} with {} networks", networks.len());
        Ok(())
    }

    async fn initialize_gateway(&self, network: &Network, dhcp_server: Ipv4Addr) -> Result<()> {
        info!("gateway {dhcp_server} for network {}", network.uuid);
        Ok(())
    }

    async fn add_vpn(&self, public_ip: Ipv4Addr, port: u16, private_ip: Ipv4Addr) -> Result<()> {
        info!("vpn forward {public_ip}:{port} -> {private_ip}");
        Ok(())
    }

    async fn remove_gateway(&self, network: &Network) -> Result<()> {
        info!("remove gateway of network {}", network.uuid);
        Ok(())
    }
}

/// A-record table kept in memory, keyed by domain then name.
#[derive(Debug, Default)]
pub struct MemoryDns {
    entries: Mutex<HashMap<String, HashMap<String, Ipv4Addr>>>,
}

impl MemoryDns {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DnsManager for MemoryDns {
    async fn create_entry(&self, name: &str, address: Ipv4Addr, record_type: &str, domain: &str) -> Result<()> {
        if record_type != "A" {
            bail!("unsupported record type {record_type} for {name}");
        }
        let mut entries = self.entries.lock().await;
        entries
            .entry(domain.to_string())
            .or_default()
            .insert(name.to_string(), address);
        Ok(())
    }

    async fn delete_entry(&self, name: &str, domain: &str) -> Result<()> {
        if let Some(zone) = self.entries.lock().await.get_mut(domain) {
            zone.remove(name);
        }
        Ok(())
    }

    async fn get_entries_by_address(&self, address: Ipv4Addr, domain: &str) -> Result<Vec<String>> {
        let entries = self.entries.lock().await;
        let mut names: Vec<String> = entries
            .get(domain)
            .map(|zone| {
                zone.iter()
                    .filter(|(_, a)| **a == address)
                    .map(|(n, _)| n.clone())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        Ok(names)
    }
}

#[derive(Debug, Default)]
pub struct LoggingSecurityGroups;

#[async_trait]
impl SecurityGroupApi for LoggingSecurityGroups {
    async fn trigger_members_refresh(&self, groups: &[String]) -> Result<()> {
        debug!("security group members refresh for {groups:?}");
        Ok(())
    }

    async fn trigger_handler(&self, handler: &str, instance: &Instance, group: &str) -> Result<()> {
        debug!("{handler} {group} for instance {}", instance.uuid);
        Ok(())
    }
}
