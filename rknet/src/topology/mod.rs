//! Isolation topologies. Each variant decides which networks an instance
//! gets, where allocations run and what host-side devices exist.

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use common::{FixedIp, FloatingIp, Instance, Network, NetworkModel, RequestedNetwork};
use libipam::ReservedIps;
use serde::{Deserialize, Serialize};

use crate::context::NetworkContext;
use crate::fixed_ip::FixedIpAllocator;
use crate::router::{DeallocPlacement, HostRouter};
use crate::rpc::NetworkRpc;
use crate::{NetworkError, Result};

pub mod dhcp;
pub mod flat;
pub mod flat_dhcp;
pub mod vlan;

pub use flat::FlatTopology;
pub use flat_dhcp::FlatDhcpTopology;
pub use vlan::VlanTopology;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyKind {
    #[default]
    Flat,
    FlatDhcp,
    Vlan,
}

impl TopologyKind {
    pub fn name(&self) -> &'static str {
        match self {
            TopologyKind::Flat => "flat",
            TopologyKind::FlatDhcp => "flat_dhcp",
            TopologyKind::Vlan => "vlan",
        }
    }
}

impl fmt::Display for TopologyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Host and project changes applied by `associate`. The outer `None` leaves
/// a field alone; `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Association {
    pub host: Option<Option<String>>,
    pub project: Option<Option<String>>,
}

#[async_trait]
pub trait NetworkTopology: Send + Sync {
    fn kind(&self) -> TopologyKind;

    fn context(&self) -> &Arc<NetworkContext>;

    /// Addresses held back at the bottom and top of every new network.
    fn reserved_ips(&self) -> ReservedIps;

    fn uses_dhcp(&self) -> bool;

    /// Whether deallocated addresses are reclaimed after a timeout.
    fn timeout_fixed_ips(&self) -> bool;

    /// Creation arguments without a usable default.
    fn required_create_args(&self) -> &'static [&'static str];

    fn router(&self) -> Option<&HostRouter> {
        None
    }

    fn network_dict(&self, network: &Network) -> NetworkModel;

    async fn networks_for_instance(
        &self,
        project_id: &str,
        requested: &[RequestedNetwork],
    ) -> Result<Vec<Network>>;

    async fn allocate_fixed_ips(
        &self,
        instance: &Instance,
        host: Option<&str>,
        networks: &[Network],
        requested: &[RequestedNetwork],
        vpn: bool,
    ) -> Result<Vec<Option<Ipv4Addr>>>;

    /// Allocates on this host and brings up the network's devices here.
    async fn allocate_fixed_ip(
        &self,
        instance: &Instance,
        network: &Network,
        address: Option<Ipv4Addr>,
        vpn: bool,
    ) -> Result<Option<Ipv4Addr>>;

    async fn deallocate_fixed_ip(
        &self,
        address: Ipv4Addr,
        host: Option<&str>,
        teardown: bool,
    ) -> Result<()>;

    /// Deallocates on this host without consulting the router.
    async fn deallocate_local(&self, address: Ipv4Addr, teardown: bool) -> Result<()> {
        deallocate_locally(self, address, teardown).await?;
        Ok(())
    }

    async fn setup_network_on_host(&self, network: &Network) -> Result<()>;

    async fn teardown_network_on_host(&self, network: &Network) -> Result<()>;

    async fn floating_ips_by_fixed_address(&self, address: Ipv4Addr) -> Result<Vec<FloatingIp>> {
        Ok(self
            .context()
            .store
            .floating_ips_by_fixed_address(address)
            .await?)
    }

    async fn add_network_to_project(
        &self,
        _project_id: &str,
        _network_uuid: Option<&str>,
    ) -> Result<Network> {
        Err(NetworkError::NotSupported("add_network_to_project", self.kind().name()))
    }

    async fn associate(&self, _network_uuid: &str, _association: &Association) -> Result<()> {
        Err(NetworkError::NotSupported("associate", self.kind().name()))
    }
}

pub fn build_topology(
    kind: TopologyKind,
    ctx: Arc<NetworkContext>,
    rpc: Arc<dyn NetworkRpc>,
) -> Arc<dyn NetworkTopology> {
    match kind {
        TopologyKind::Flat => Arc::new(FlatTopology::new(ctx)),
        TopologyKind::FlatDhcp => Arc::new(FlatDhcpTopology::new(ctx.clone(), HostRouter::new(ctx, rpc))),
        TopologyKind::Vlan => Arc::new(VlanTopology::new(ctx.clone(), HostRouter::new(ctx, rpc))),
    }
}

/// Identity fields shared by every topology.
pub(crate) fn base_network_dict(network: &Network) -> NetworkModel {
    NetworkModel {
        id: network.uuid.clone(),
        bridge: network.bridge.clone(),
        label: network.label.clone(),
        tenant_id: network.project_id.clone(),
        injected: network.injected.then_some(true),
        ..Default::default()
    }
}

/// Requested networks, or every network without a VLAN.
pub(crate) async fn flat_networks(
    ctx: &NetworkContext,
    requested: &[RequestedNetwork],
) -> Result<Vec<Network>> {
    let networks = if requested.is_empty() {
        ctx.store.network_get_all().await?
    } else {
        let uuids: Vec<String> = requested.iter().map(|r| r.network_uuid.clone()).collect();
        ctx.store.network_get_all_by_uuids(&uuids).await?
    };
    Ok(networks.into_iter().filter(|n| n.vlan.is_none()).collect())
}

/// Releases the address here, then optionally sends a DHCP release and
/// tears the network's devices down. Returns the row before release.
pub async fn deallocate_locally<T: NetworkTopology + ?Sized>(
    topology: &T,
    address: Ipv4Addr,
    teardown: bool,
) -> Result<FixedIp> {
    let ctx = topology.context();
    let allocator = FixedIpAllocator::new(ctx);
    let prior = allocator.deallocate(address).await?;
    if teardown {
        let network = ctx.store.network_get(prior.network_id).await?;
        if ctx.config.force_dhcp_release && !allocator.force_dhcp_release(&network, &prior).await? {
            return Ok(prior);
        }
        topology.teardown_network_on_host(&network).await?;
    }
    Ok(prior)
}

/// Deallocation for the routed topologies.
pub(crate) async fn routed_deallocate<T: NetworkTopology + ?Sized>(
    topology: &T,
    router: &HostRouter,
    address: Ipv4Addr,
    host: Option<&str>,
    teardown: bool,
) -> Result<()> {
    let store = &topology.context().store;
    let fixed_ip = store.fixed_ip_get_by_address(address).await?;
    let network = store.network_get(fixed_ip.network_id).await?;
    match router.dealloc_placement(&network, host).await? {
        DeallocPlacement::Local => topology.deallocate_local(address, teardown).await,
        DeallocPlacement::LocalWithoutTeardown => topology.deallocate_local(address, false).await,
        DeallocPlacement::Remote(target) => {
            router
                .rpc()
                .deallocate_fixed_ip(&target, address, host)
                .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_match_config_values() {
        for kind in [TopologyKind::Flat, TopologyKind::FlatDhcp, TopologyKind::Vlan] {
            let yaml = serde_yaml::to_string(&kind).unwrap();
            assert_eq!(yaml.trim(), kind.name());
            let back: TopologyKind = serde_yaml::from_str(kind.name()).unwrap();
            assert_eq!(back, kind);
        }
    }
}
