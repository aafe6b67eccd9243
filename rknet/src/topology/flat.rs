use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use common::{FloatingIp, Instance, Network, NetworkModel, RequestedNetwork};
use libipam::ReservedIps;
use log::debug;

use super::{NetworkTopology, TopologyKind, base_network_dict, deallocate_locally, flat_networks};
use crate::Result;
use crate::batch::join_barrier;
use crate::context::NetworkContext;
use crate::fixed_ip::FixedIpAllocator;
use crate::router::requested_address;

/// One shared network, no DHCP server, guest configuration injected. Every
/// operation runs on the calling host.
pub struct FlatTopology {
    ctx: Arc<NetworkContext>,
}

impl FlatTopology {
    pub fn new(ctx: Arc<NetworkContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl NetworkTopology for FlatTopology {
    fn kind(&self) -> TopologyKind {
        TopologyKind::Flat
    }

    fn context(&self) -> &Arc<NetworkContext> {
        &self.ctx
    }

    fn reserved_ips(&self) -> ReservedIps {
        ReservedIps::BASE
    }

    fn uses_dhcp(&self) -> bool {
        false
    }

    fn timeout_fixed_ips(&self) -> bool {
        false
    }

    fn required_create_args(&self) -> &'static [&'static str] {
        &["bridge"]
    }

    fn network_dict(&self, network: &Network) -> NetworkModel {
        base_network_dict(network)
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
        _host: Option<&str>,
        networks: &[Network],
        requested: &[RequestedNetwork],
        _vpn: bool,
    ) -> Result<Vec<Option<Ipv4Addr>>> {
        let branches = networks.iter().map(|network| {
            let address = requested_address(requested, network);
            self.allocate_fixed_ip(instance, network, address, false)
        })
        .collect::<Vec<_>>();
        join_barrier(self.ctx.config.max_concurrent_allocations, branches).await
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
        _host: Option<&str>,
        teardown: bool,
    ) -> Result<()> {
        self.deallocate_local(address, teardown).await
    }

    /// No DHCP server will ever report the release, so the address goes
    /// back to the pool right away.
    async fn deallocate_local(&self, address: Ipv4Addr, teardown: bool) -> Result<()> {
        deallocate_locally(self, address, teardown).await?;
        self.ctx.store.fixed_ip_disassociate(address).await?;
        Ok(())
    }

    async fn setup_network_on_host(&self, network: &Network) -> Result<()> {
        let injected = self.ctx.config.flat_injected;
        if network.injected != injected {
            let mut updated = network.clone();
            updated.injected = injected;
            self.ctx.store.network_update(&updated).await?;
        }
        Ok(())
    }

    async fn teardown_network_on_host(&self, network: &Network) -> Result<()> {
        debug!("nothing to tear down for flat network {}", network.uuid);
        Ok(())
    }

    async fn floating_ips_by_fixed_address(&self, _address: Ipv4Addr) -> Result<Vec<FloatingIp>> {
        Ok(Vec::new())
    }
}
