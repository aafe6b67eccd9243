//! Entry point of the network service: the operations callers and peer
//! hosts invoke, delegating topology-specific work to the active topology.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use common::{Instance, Network, NetworkInfo, RequestedNetwork};
use ipnetwork::IpNetwork;
use libipam::ip::to_global;
use libipam::mac::parse_mac;
use log::{debug, error, info, warn};
use regex::Regex;

use crate::context::NetworkContext;
use crate::create::{CreateNetworkRequest, create_networks};
use crate::driver::DhcpHost;
use crate::fixed_ip::{FixedIpAllocator, dns_label};
use crate::nw_info::NetworkInfoBuilder;
use crate::router::Placement;
use crate::rpc::{NetworkRequest, NetworkResponse, NetworkRpc, RpcHandler};
use crate::store::StoreError;
use crate::topology::{Association, NetworkTopology, TopologyKind, build_topology};
use crate::vif::MacAddressAllocator;
use crate::{NetworkError, Result};

/// Search criteria of `get_instance_uuids_by_ip_filter`. `ip` and `ip6` are
/// regular expressions anchored at the start of the address.
#[derive(Debug, Clone, Default)]
pub struct IpFilter {
    pub fixed_ip: Option<Ipv4Addr>,
    pub ip: Option<String>,
    pub ip6: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceIp {
    pub instance_uuid: String,
    pub ip: IpAddr,
}

fn anchored(pattern: Option<&str>) -> Result<Option<Regex>> {
    pattern
        .map(|p| {
            Regex::new(&format!("^(?:{p})"))
                .map_err(|e| NetworkError::InvalidInput(format!("bad ip filter {p}: {e}")))
        })
        .transpose()
}

pub struct NetworkManager {
    ctx: Arc<NetworkContext>,
    topology: Arc<dyn NetworkTopology>,
    rpc: Arc<dyn NetworkRpc>,
}

impl NetworkManager {
    pub fn new(kind: TopologyKind, ctx: Arc<NetworkContext>, rpc: Arc<dyn NetworkRpc>) -> Self {
        let topology = build_topology(kind, ctx.clone(), rpc.clone());
        Self { ctx, topology, rpc }
    }

    pub fn context(&self) -> &Arc<NetworkContext> {
        &self.ctx
    }

    pub fn topology(&self) -> &Arc<dyn NetworkTopology> {
        &self.topology
    }

    /// Brings up the gateway and devices of every network this host
    /// already serves.
    pub async fn init_host(&self) -> Result<()> {
        let networks = self.ctx.store.network_get_all_by_host(&self.ctx.host).await?;
        if self.topology.uses_dhcp() {
            self.ctx
                .l3
                .initialize(Some(self.ctx.config.fixed_range), &networks)
                .await?;
        }
        for network in &networks {
            self.topology.setup_network_on_host(network).await?;
            if self.ctx.config.update_dns_entries {
                let dev = self.ctx.device.get_dev(network).await?;
                self.ctx.device.update_dns(&dev, network).await?;
            }
        }
        info!(
            "{} host {} initialized with {} network(s)",
            self.topology.kind(),
            self.ctx.host,
            networks.len()
        );
        Ok(())
    }

    /// Creates the instance's interfaces, allocates one address per network
    /// and returns the resulting network view.
    pub async fn allocate_for_instance(
        &self,
        instance_uuid: &str,
        host: Option<&str>,
        requested: &[RequestedNetwork],
        vpn: bool,
    ) -> Result<NetworkInfo> {
        let instance = self.ctx.store.instance_get_by_uuid(instance_uuid, false).await?;
        let host = host.or(instance.host.as_deref());
        let networks = self
            .topology
            .networks_for_instance(&instance.project_id, requested)
            .await?;
        debug!(
            "networks retrieved for instance {instance_uuid}: {:?}",
            networks.iter().map(|n| &n.uuid).collect::<Vec<_>>()
        );

        if let Err(e) = self.allocate_mac_addresses(&instance, &networks).await {
            self.ctx
                .store
                .virtual_interface_delete_by_instance(instance_uuid)
                .await?;
            return Err(e);
        }
        self.topology
            .allocate_fixed_ips(&instance, host, &networks, requested, vpn)
            .await?;

        if self.ctx.config.update_dns_entries {
            let ids: Vec<i64> = networks.iter().map(|n| n.id).collect();
            self.rpc.update_dns(&ids).await;
        }
        self.get_instance_nw_info(instance_uuid, host).await
    }

    async fn allocate_mac_addresses(&self, instance: &Instance, networks: &[Network]) -> Result<()> {
        let macs = MacAddressAllocator::new(
            self.ctx.store.as_ref(),
            self.ctx.config.create_unique_mac_address_attempts,
        );
        for network in networks {
            let existing = self
                .ctx
                .store
                .virtual_interface_get_by_instance_and_network(&instance.uuid, network.id)
                .await?;
            if existing.is_none() {
                macs.create(&instance.uuid, network.id).await?;
            }
        }
        Ok(())
    }

    /// Releases every address of the instance and removes its interfaces.
    /// Works for instances that were already deleted.
    pub async fn deallocate_for_instance(&self, instance_uuid: &str, host: Option<&str>) -> Result<()> {
        let instance = self.ctx.store.instance_get_by_uuid(instance_uuid, true).await?;
        let host = host.or(instance.host.as_deref());
        let fixed_ips = self.ctx.store.fixed_ip_get_by_instance(instance_uuid).await?;
        debug!("network deallocation for instance {instance_uuid}");

        for fixed_ip in &fixed_ips {
            if let Err(e) = self
                .topology
                .deallocate_fixed_ip(fixed_ip.address, host, true)
                .await
            {
                error!("failed to deallocate {} of {instance_uuid}: {e}", fixed_ip.address);
            }
        }
        if self.ctx.config.update_dns_entries {
            let ids: Vec<i64> = fixed_ips.iter().map(|ip| ip.network_id).collect();
            self.rpc.update_dns(&ids).await;
        }
        self.ctx
            .store
            .virtual_interface_delete_by_instance(instance_uuid)
            .await?;
        Ok(())
    }

    pub async fn get_instance_nw_info(
        &self,
        instance_uuid: &str,
        host: Option<&str>,
    ) -> Result<NetworkInfo> {
        let instance = self.ctx.store.instance_get_by_uuid(instance_uuid, true).await?;
        let host = host.or(instance.host.as_deref());
        let vifs = self
            .ctx
            .store
            .virtual_interface_get_by_instance(instance_uuid)
            .await?;
        let mut networks = HashMap::new();
        for vif in &vifs {
            if networks.contains_key(&vif.network_id) {
                continue;
            }
            match self.ctx.store.network_get(vif.network_id).await {
                Ok(network) => {
                    networks.insert(network.id, network);
                }
                Err(StoreError::NetworkNotFound(_)) => {
                    warn!("network {} of vif {} is gone", vif.network_id, vif.uuid)
                }
                Err(e) => return Err(e.into()),
            }
        }
        NetworkInfoBuilder::new(self.topology.as_ref())
            .build(&vifs, &networks, instance.rxtx_factor, host)
            .await
    }

    pub async fn add_fixed_ip_to_instance(
        &self,
        instance_uuid: &str,
        host: Option<&str>,
        network_uuid: &str,
    ) -> Result<NetworkInfo> {
        let instance = self.ctx.store.instance_get_by_uuid(instance_uuid, false).await?;
        let host = host.or(instance.host.as_deref());
        let network = self.ctx.store.network_get_by_uuid(network_uuid).await?;
        self.allocate_mac_addresses(&instance, std::slice::from_ref(&network))
            .await?;
        self.topology
            .allocate_fixed_ips(&instance, host, std::slice::from_ref(&network), &[], false)
            .await?;
        self.get_instance_nw_info(instance_uuid, host).await
    }

    pub async fn remove_fixed_ip_from_instance(
        &self,
        instance_uuid: &str,
        host: Option<&str>,
        address: Ipv4Addr,
    ) -> Result<NetworkInfo> {
        let instance = self.ctx.store.instance_get_by_uuid(instance_uuid, true).await?;
        let host = host.or(instance.host.as_deref());
        let fixed_ip = self
            .ctx
            .store
            .fixed_ip_get_by_instance(instance_uuid)
            .await?
            .into_iter()
            .find(|ip| ip.address == address)
            .ok_or_else(|| NetworkError::FixedIpNotFoundForInstance {
                instance_uuid: instance_uuid.to_string(),
                address,
            })?;
        self.topology.deallocate_fixed_ip(address, host, true).await?;
        // Not a DHCP lease, so nothing will report the release.
        if !fixed_ip.leased {
            self.ctx.store.fixed_ip_disassociate(address).await?;
        }
        self.get_instance_nw_info(instance_uuid, host).await
    }

    /// Checks that requested networks exist and requested addresses are on
    /// their network and free.
    pub async fn validate_networks(&self, requested: &[RequestedNetwork]) -> Result<()> {
        if requested.is_empty() {
            return Ok(());
        }
        let uuids: Vec<String> = requested.iter().map(|r| r.network_uuid.clone()).collect();
        let networks = self.ctx.store.network_get_all_by_uuids(&uuids).await?;
        for req in requested {
            let Some(address) = req.address else {
                continue;
            };
            let fixed_ip = self.ctx.store.fixed_ip_get_by_address(address).await?;
            let on_network = networks
                .iter()
                .any(|n| n.uuid == req.network_uuid && n.id == fixed_ip.network_id);
            if !on_network {
                return Err(NetworkError::FixedIpNotFoundForNetwork {
                    address,
                    network_uuid: req.network_uuid.clone(),
                });
            }
            if let Some(owner) = fixed_ip.instance_uuid {
                return Err(StoreError::FixedIpAlreadyInUse {
                    address,
                    instance_uuid: owner,
                }
                .into());
            }
        }
        Ok(())
    }

    /// Sets up (or tears down) the networks of an instance's interfaces on
    /// the hosts that own them.
    pub async fn setup_networks_on_host(
        &self,
        instance_uuid: &str,
        host: Option<&str>,
        teardown: bool,
    ) -> Result<()> {
        let vifs = self
            .ctx
            .store
            .virtual_interface_get_by_instance(instance_uuid)
            .await?;
        let mut seen = HashSet::new();
        for vif in vifs {
            if !seen.insert(vif.network_id) {
                continue;
            }
            let network = self.ctx.store.network_get(vif.network_id).await?;
            let placement = match self.topology.router() {
                Some(router) => router.placement(&network, host).await?,
                None => Placement::Local,
            };
            match placement {
                Placement::Local => self.rpc_setup_network_on_host(network.id, teardown).await?,
                Placement::Remote(target) => {
                    self.rpc
                        .setup_network_on_host(&target, network.id, teardown)
                        .await?
                }
            }
        }
        Ok(())
    }

    pub async fn rpc_setup_network_on_host(&self, network_id: i64, teardown: bool) -> Result<()> {
        let network = self.ctx.store.network_get(network_id).await?;
        if teardown {
            self.topology.teardown_network_on_host(&network).await
        } else {
            self.topology.setup_network_on_host(&network).await
        }
    }

    pub async fn lease_fixed_ip(&self, address: Ipv4Addr) -> Result<()> {
        FixedIpAllocator::new(&self.ctx).lease(address).await
    }

    pub async fn release_fixed_ip(&self, address: Ipv4Addr) -> Result<()> {
        FixedIpAllocator::new(&self.ctx).release(address).await
    }

    pub async fn create_networks(&self, req: CreateNetworkRequest) -> Result<Vec<Network>> {
        create_networks(self.topology.as_ref(), req).await
    }

    /// Deletes a network by uuid, or by cidr when no uuid is given.
    pub async fn delete_network(
        &self,
        uuid: Option<&str>,
        cidr: Option<IpNetwork>,
        require_disassociated: bool,
    ) -> Result<()> {
        let network = match (uuid, cidr) {
            (Some(uuid), _) => self.ctx.store.network_get_by_uuid(uuid).await?,
            (None, Some(cidr)) => self.ctx.store.network_get_by_cidr(cidr).await?,
            (None, None) => {
                return Err(NetworkError::InvalidInput(
                    "a network uuid or cidr is required".to_string(),
                ));
            }
        };
        if require_disassociated && let Some(project) = network.project_id {
            return Err(NetworkError::NetworkNotDisassociated { project });
        }
        self.ctx.store.network_delete_safe(network.id).await?;
        info!("deleted network {} ({})", network.label, network.uuid);
        Ok(())
    }

    pub async fn get_network(&self, uuid: &str) -> Result<Network> {
        Ok(self.ctx.store.network_get_by_uuid(uuid).await?)
    }

    pub async fn get_all_networks(&self) -> Result<Vec<Network>> {
        Ok(self.ctx.store.network_get_all().await?)
    }

    /// Clears both the host and the project of a network.
    pub async fn disassociate_network(&self, uuid: &str) -> Result<()> {
        let network = self.ctx.store.network_get_by_uuid(uuid).await?;
        self.ctx
            .store
            .network_disassociate(network.id, true, true)
            .await?;
        Ok(())
    }

    pub async fn add_network_to_project(
        &self,
        project_id: &str,
        network_uuid: Option<&str>,
    ) -> Result<Network> {
        self.topology
            .add_network_to_project(project_id, network_uuid)
            .await
    }

    pub async fn associate(&self, network_uuid: &str, association: &Association) -> Result<()> {
        self.topology.associate(network_uuid, association).await
    }

    /// Refreshes the DNS hosts of the listed multi-host networks served
    /// here.
    pub async fn update_dns(&self, network_ids: &[i64]) -> Result<()> {
        if self.topology.kind() == TopologyKind::Flat || self.ctx.config.fake_network {
            return Ok(());
        }
        debug!("update dns for network ids {network_ids:?}");
        for network in self.ctx.store.network_get_all_by_host(&self.ctx.host).await? {
            if network.multi_host && network_ids.contains(&network.id) {
                let dev = self.ctx.device.get_dev(&network).await?;
                self.ctx.device.update_dns(&dev, &network).await?;
            }
        }
        Ok(())
    }

    /// Periodic refresh of the DNS hosts of every network served here.
    pub async fn refresh_dns(&self) -> Result<()> {
        for network in self.ctx.store.network_get_all_by_host(&self.ctx.host).await? {
            let dev = self.ctx.device.get_dev(&network).await?;
            self.ctx.device.update_dns(&dev, &network).await?;
        }
        Ok(())
    }

    /// Reclaims addresses whose release was never reported. A no-op for
    /// topologies without DHCP.
    pub async fn disassociate_stale_fixed_ips(&self) -> Result<usize> {
        if !self.topology.timeout_fixed_ips() {
            return Ok(0);
        }
        let timeout = Duration::seconds(self.ctx.config.fixed_ip_disassociate_timeout as i64);
        FixedIpAllocator::new(&self.ctx)
            .disassociate_stale(timeout)
            .await
    }

    /// Lease file contents of a network: leased, allocated addresses of
    /// instances served by this host.
    pub async fn get_dhcp_leases(&self, network_uuid: &str) -> Result<String> {
        let store = &self.ctx.store;
        let network = store.network_get_by_uuid(network_uuid).await?;
        let mut hosts = Vec::new();
        for fixed_ip in store.fixed_ips_by_network(network.id).await? {
            if !(fixed_ip.allocated && fixed_ip.leased) {
                continue;
            }
            let (Some(uuid), Some(vif_id)) = (&fixed_ip.instance_uuid, fixed_ip.virtual_interface_id)
            else {
                continue;
            };
            let instance = store.instance_get_by_uuid(uuid, true).await?;
            if network.multi_host && instance.host.as_deref() != Some(self.ctx.host.as_str()) {
                continue;
            }
            let Some(vif) = store.virtual_interface_get(vif_id).await? else {
                continue;
            };
            hosts.push(DhcpHost {
                mac: vif.address,
                address: fixed_ip.address,
                hostname: format!("{}.{}", dns_label(&instance.display_name), self.ctx.config.dhcp_domain),
            });
        }
        Ok(self.ctx.device.get_dhcp_leases(&network, &hosts).await?)
    }

    /// Instances having an address that matches the filter, with the
    /// matching address. Scans every interface.
    pub async fn get_instance_uuids_by_ip_filter(&self, filter: &IpFilter) -> Result<Vec<InstanceIp>> {
        let ip_re = anchored(filter.ip.as_deref())?;
        let ip6_re = anchored(filter.ip6.as_deref())?;
        let hit = |re: &Option<Regex>, address: &str| re.as_ref().is_some_and(|re| re.is_match(address));

        let mut networks: HashMap<i64, Network> = HashMap::new();
        let mut results = Vec::new();
        for vif in self.ctx.store.virtual_interface_get_all().await? {
            if !networks.contains_key(&vif.network_id) {
                match self.ctx.store.network_get(vif.network_id).await {
                    Ok(n) => {
                        networks.insert(n.id, n);
                    }
                    Err(StoreError::NetworkNotFound(_)) => continue,
                    Err(e) => return Err(e.into()),
                }
            }
            let Some(network) = networks.get(&vif.network_id) else {
                continue;
            };

            if let Some(cidr_v6) = network.cidr_v6
                && let Ok(v6) = parse_mac(&vif.address).and_then(|mac| to_global(&cidr_v6, mac))
                && hit(&ip6_re, &v6.to_string())
            {
                results.push(InstanceIp {
                    instance_uuid: vif.instance_uuid.clone(),
                    ip: IpAddr::V6(v6),
                });
            }

            for fixed_ip in self.ctx.store.fixed_ips_by_virtual_interface(vif.id).await? {
                let address = fixed_ip.address;
                if Some(address) == filter.fixed_ip || hit(&ip_re, &address.to_string()) {
                    results.push(InstanceIp {
                        instance_uuid: vif.instance_uuid.clone(),
                        ip: IpAddr::V4(address),
                    });
                    continue;
                }
                for floating in self.topology.floating_ips_by_fixed_address(address).await? {
                    if hit(&ip_re, &floating.address.to_string()) {
                        results.push(InstanceIp {
                            instance_uuid: vif.instance_uuid.clone(),
                            ip: IpAddr::V4(floating.address),
                        });
                    }
                }
            }
        }
        Ok(results)
    }

    async fn dispatch(&self, request: NetworkRequest) -> Result<NetworkResponse> {
        match request {
            NetworkRequest::AllocateFixedIp {
                instance_uuid,
                network_id,
                address,
                vpn,
            } => {
                let instance = self.ctx.store.instance_get_by_uuid(&instance_uuid, false).await?;
                let network = self.ctx.store.network_get(network_id).await?;
                let address = self
                    .topology
                    .allocate_fixed_ip(&instance, &network, address, vpn)
                    .await?;
                Ok(NetworkResponse::Address(address))
            }
            NetworkRequest::DeallocateFixedIp { address, .. } => {
                self.topology.deallocate_local(address, true).await?;
                Ok(NetworkResponse::Ack)
            }
            NetworkRequest::SetupNetworkOnHost {
                network_id,
                teardown,
            } => {
                self.rpc_setup_network_on_host(network_id, teardown).await?;
                Ok(NetworkResponse::Ack)
            }
            NetworkRequest::UpdateDns { network_ids } => {
                self.update_dns(&network_ids).await?;
                Ok(NetworkResponse::Ack)
            }
            NetworkRequest::LeaseFixedIp { address } => {
                self.lease_fixed_ip(address).await?;
                Ok(NetworkResponse::Ack)
            }
            NetworkRequest::ReleaseFixedIp { address } => {
                self.release_fixed_ip(address).await?;
                Ok(NetworkResponse::Ack)
            }
            NetworkRequest::Ping => Ok(NetworkResponse::Pong),
        }
    }
}

#[async_trait]
impl RpcHandler for NetworkManager {
    async fn handle(&self, request: NetworkRequest) -> NetworkResponse {
        debug!("handling {request:?}");
        match self.dispatch(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!("rpc request failed: {e}");
                NetworkResponse::Error(e.to_string())
            }
        }
    }
}
