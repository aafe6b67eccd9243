use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use common::{Instance, Network, NetworkModel, RequestedNetwork};
use libipam::ReservedIps;
use log::debug;

use super::dhcp::{get_dhcp_ip, update_dhcp_and_ra};
use super::{NetworkTopology, TopologyKind, base_network_dict, flat_networks, routed_deallocate};
use crate::Result;
use crate::context::NetworkContext;
use crate::fixed_ip::FixedIpAllocator;
use crate::router::HostRouter;

/// Flat network with a DHCP server and gateway on the owning host, or on
/// every compute host for multi-host networks.
pub struct FlatDhcpTopology {
    ctx: Arc<NetworkContext>,
    router: HostRouter,
}

impl FlatDhcpTopology {
    pub fn new(ctx: Arc<NetworkContext>, router: HostRouter) -> Self {
        Self { ctx, router }
    }
}

#[async_trait]
impl NetworkTopology for FlatDhcpTopology {
    fn kind(&self) -> TopologyKind {
        TopologyKind::FlatDhcp
    }

    fn context(&self) -> &Arc<NetworkContext> {
        &self.ctx
    }

    fn reserved_ips(&self) -> ReservedIps {
        ReservedIps::BASE
    }

    fn uses_dhcp(&self) -> bool {
        true
    }

    fn timeout_fixed_ips(&self) -> bool {
        true
    }

    fn required_create_args(&self) -> &'static [&'static str] {
        &["bridge"]
    }

    fn router(&self) -> Option<&HostRouter> {
        Some(&self.router)
    }

    fn network_dict(&self, network: &Network) -> NetworkModel {
        NetworkModel {
            should_create_bridge: Some(true),
            bridge_interface: network.bridge_interface.clone(),
            multi_host: Some(network.multi_host),
            ..base_network_dict(network)
        }
    }

    async fn networks_for_instance(
        &self,
        _project_id: &str,
        requested: &[RequestedNetwork],
    ) -> Result<Vec<Network>> {
        flat_networks(&self.ctx, requested).await
    }

    async fn allocate_fixed_ips(
        &self,
        instance: &Instance,
        host: Option<&str>,
        networks: &[Network],
        requested: &[RequestedNetwork],
        _vpn: bool,
    ) -> Result<Vec<Option<Ipv4Addr>>> {
        self.router
            .allocate_fixed_ips(instance, host, networks, requested, false, |network, address| async move {
                self.allocate_fixed_ip(instance, &network, address, false).await
            })
            .await
    }

    async fn allocate_fixed_ip(
        &self,
        instance: &Instance,
        network: &Network,
        address: Option<Ipv4Addr>,
        _vpn: bool,
    ) -> Result<Option<Ipv4Addr>> {
        let address = FixedIpAllocator::new(&self.ctx)
            .allocate(instance, network, address, false)
            .await?;
        self.setup_network_on_host(network).await?;
        Ok(address)
    }

    async fn deallocate_fixed_ip(
        &self,
        address: Ipv4Addr,
        host: Option<&str>,
        teardown: bool,
    ) -> Result<()> {
        routed_deallocate(self, &self.router, address, host, teardown).await
    }

    async fn setup_network_on_host(&self, network: &Network) -> Result<()> {
        if network.cidr.is_none() {
            debug!("network {} has no v4 block, no dhcp to set up", network.uuid);
            return Ok(());
        }
        let dhcp_server = get_dhcp_ip(&self.ctx, network, &self.ctx.host).await?;
        self.ctx.l3.initialize_gateway(network, dhcp_server).await?;
        update_dhcp_and_ra(&self.ctx, network, dhcp_server).await
    }

    async fn teardown_network_on_host(&self, network: &Network) -> Result<()> {
        if self.ctx.config.fake_network || network.cidr.is_none() {
            return Ok(());
        }
        let dhcp_server = get_dhcp_ip(&self.ctx, network, &self.ctx.host).await?;
        let dev = self.ctx.device.get_dev(network).await?;
        self.ctx.device.update_dhcp(&dev, network, dhcp_server).await?;
        Ok(())
    }
}
