use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use common::{Instance, Network, NetworkModel, RequestedNetwork};
use libipam::ReservedIps;
use log::{debug, info};

use super::dhcp::{get_dhcp_ip, update_dhcp_and_ra};
use super::{Association, NetworkTopology, TopologyKind, base_network_dict, routed_deallocate};
use crate::context::NetworkContext;
use crate::fixed_ip::FixedIpAllocator;
use crate::router::HostRouter;
use crate::store::{FixedIpUpdate, StoreError};
use crate::{NetworkError, Result};

/// One VLAN and bridge per project, reachable from outside through a VPN
/// endpoint that owns the network's third address.
pub struct VlanTopology {
    ctx: Arc<NetworkContext>,
    router: HostRouter,
    reserved: ReservedIps,
}

impl VlanTopology {
    pub fn new(ctx: Arc<NetworkContext>, router: HostRouter) -> Self {
        let reserved = ReservedIps::new(
            ReservedIps::BASE.bottom + 1,
            ReservedIps::BASE.top + ctx.config.cnt_vpn_clients,
        );
        Self {
            ctx,
            router,
            reserved,
        }
    }

    /// Sets the VPN endpoint on first use. Returns the network as stored and
    /// the public address in effect.
    async fn ensure_vpn_public_address(&self, network: &Network) -> Result<(Network, Option<Ipv4Addr>)> {
        match network.vpn_public_address {
            Some(address) => Ok((network.clone(), Some(address))),
            None => {
                let mut updated = network.clone();
                updated.vpn_public_address = self.ctx.config.vpn_ip;
                let updated = self.ctx.store.network_update(&updated).await?;
                let address = updated.vpn_public_address;
                Ok((updated, address))
            }
        }
    }
}

#[async_trait]
impl NetworkTopology for VlanTopology {
    fn kind(&self) -> TopologyKind {
        TopologyKind::Vlan
    }

    fn context(&self) -> &Arc<NetworkContext> {
        &self.ctx
    }

    fn reserved_ips(&self) -> ReservedIps {
        self.reserved
    }

    fn uses_dhcp(&self) -> bool {
        true
    }

    fn timeout_fixed_ips(&self) -> bool {
        true
    }

    fn required_create_args(&self) -> &'static [&'static str] {
        &["bridge_interface"]
    }

    fn router(&self) -> Option<&HostRouter> {
        Some(&self.router)
    }

    fn network_dict(&self, network: &Network) -> NetworkModel {
        NetworkModel {
            should_create_bridge: Some(true),
            should_create_vlan: Some(true),
            vlan: network.vlan,
            bridge_interface: network.bridge_interface.clone(),
            multi_host: Some(network.multi_host),
            ..base_network_dict(network)
        }
    }

    /// Requested networks must belong to the project. Without a request the
    /// project's networks are used, associating a free one if it has none.
    async fn networks_for_instance(
        &self,
        project_id: &str,
        requested: &[RequestedNetwork],
    ) -> Result<Vec<Network>> {
        if requested.is_empty() {
            return Ok(self.ctx.store.project_get_networks(project_id, true).await?);
        }
        let uuids: Vec<String> = requested.iter().map(|r| r.network_uuid.clone()).collect();
        let networks = self.ctx.store.network_get_all_by_uuids(&uuids).await?;
        if let Some(foreign) = networks
            .iter()
            .find(|n| n.project_id.as_deref() != Some(project_id))
        {
            return Err(StoreError::NetworkNotFound(foreign.uuid.clone()).into());
        }
        Ok(networks)
    }

    async fn allocate_fixed_ips(
        &self,
        instance: &Instance,
        host: Option<&str>,
        networks: &[Network],
        requested: &[RequestedNetwork],
        vpn: bool,
    ) -> Result<Vec<Option<Ipv4Addr>>> {
        self.router
            .allocate_fixed_ips(instance, host, networks, requested, vpn, |network, address| async move {
                self.allocate_fixed_ip(instance, &network, address, vpn).await
            })
            .await
    }

    async fn allocate_fixed_ip(
        &self,
        instance: &Instance,
        network: &Network,
        address: Option<Ipv4Addr>,
        vpn: bool,
    ) -> Result<Option<Ipv4Addr>> {
        let address = FixedIpAllocator::new(&self.ctx)
            .allocate(instance, network, address, vpn)
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
        let _guard = self.ctx.locks.lock("setup_network", network.id).await;
        let (network, public_address) = self.ensure_vpn_public_address(network).await?;
        let dhcp_server = get_dhcp_ip(&self.ctx, &network, &self.ctx.host).await?;
        self.ctx.l3.initialize_gateway(&network, dhcp_server).await?;

        // Only forward when the endpoint was not set by hand.
        if let (Some(public), Some(port), Some(private)) = (
            public_address,
            network.vpn_public_port,
            network.vpn_private_address,
        ) && Some(public) == self.ctx.config.vpn_ip
        {
            self.ctx.l3.add_vpn(public, port, private).await?;
        }
        update_dhcp_and_ra(&self.ctx, &network, dhcp_server).await
    }

    async fn teardown_network_on_host(&self, network: &Network) -> Result<()> {
        let _guard = self.ctx.locks.lock("setup_network", network.id).await;
        if self.ctx.config.fake_network {
            return Ok(());
        }
        let dhcp_server = get_dhcp_ip(&self.ctx, network, &self.ctx.host).await?;
        let dev = self.ctx.device.get_dev(network).await?;

        let unused_gateway = self.ctx.config.teardown_unused_network_gateway
            && network.multi_host
            && network.vpn_public_address != self.ctx.config.vpn_ip
            && !self
                .ctx
                .store
                .network_in_use_on_host(network.id, &self.ctx.host)
                .await?;
        if !unused_gateway {
            self.ctx.device.update_dhcp(&dev, network, dhcp_server).await?;
            return Ok(());
        }

        debug!("remove unused gateway {dev}");
        self.ctx.device.kill_dhcp(&dev).await?;
        self.ctx.l3.remove_gateway(network).await?;
        if !self.ctx.config.share_dhcp_address {
            self.ctx
                .store
                .fixed_ip_update(
                    dhcp_server,
                    &FixedIpUpdate {
                        allocated: Some(false),
                        host: Some(None),
                        ..Default::default()
                    },
                )
                .await?;
        }
        Ok(())
    }

    async fn add_network_to_project(
        &self,
        project_id: &str,
        network_uuid: Option<&str>,
    ) -> Result<Network> {
        let network_id = match network_uuid {
            Some(uuid) => Some(self.ctx.store.network_get_by_uuid(uuid).await?.id),
            None => None,
        };
        let network = self
            .ctx
            .store
            .network_associate(project_id, network_id, true)
            .await?;
        info!("network {} added to project {project_id}", network.uuid);
        Ok(network)
    }

    async fn associate(&self, network_uuid: &str, association: &Association) -> Result<()> {
        if association.host.is_none() && association.project.is_none() {
            return Err(NetworkError::InvalidInput("nothing to associate".to_string()));
        }
        let store = &self.ctx.store;
        let network = store.network_get_by_uuid(network_uuid).await?;
        match &association.host {
            Some(None) => store.network_disassociate(network.id, true, false).await?,
            Some(Some(host)) => {
                let mut updated = store.network_get(network.id).await?;
                updated.host = Some(host.clone());
                store.network_update(&updated).await?;
            }
            None => {}
        }
        match &association.project {
            Some(None) => store.network_disassociate(network.id, false, true).await?,
            Some(Some(project)) => {
                store.network_associate(project, Some(network.id), true).await?;
            }
            None => {}
        }
        Ok(())
    }
}
