//! Decides which host runs a fixed-IP operation and forwards it there.

use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::Arc;

use common::{Instance, Network, RequestedNetwork};
use log::{debug, warn};

use crate::Result;
use crate::batch::join_barrier;
use crate::context::NetworkContext;
use crate::rpc::NetworkRpc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    Local,
    Remote(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeallocPlacement {
    Local,
    /// The owning host is unreachable: release the address here and leave
    /// its devices alone.
    LocalWithoutTeardown,
    Remote(String),
}

/// Address asked for on `network`, if any.
pub fn requested_address(requested: &[RequestedNetwork], network: &Network) -> Option<Ipv4Addr> {
    requested
        .iter()
        .find(|r| r.network_uuid == network.uuid)
        .and_then(|r| r.address)
}

pub struct HostRouter {
    ctx: Arc<NetworkContext>,
    rpc: Arc<dyn NetworkRpc>,
}

impl HostRouter {
    pub fn new(ctx: Arc<NetworkContext>, rpc: Arc<dyn NetworkRpc>) -> Self {
        Self { ctx, rpc }
    }

    pub fn rpc(&self) -> &Arc<dyn NetworkRpc> {
        &self.rpc
    }

    /// Single-host networks belong to `network.host`; multi-host networks to
    /// the host the caller names. An unowned network is claimed for this
    /// host, keeping whichever host won the claim.
    pub async fn authoritative_host(&self, network: &Network, host: Option<&str>) -> Result<String> {
        let host = if network.multi_host {
            host.map(str::to_string)
        } else {
            network.host.clone()
        };
        match host {
            Some(host) => Ok(host),
            None => {
                let winner = self
                    .ctx
                    .store
                    .network_set_host(network.id, &self.ctx.host)
                    .await?;
                debug!("network {} now owned by {winner}", network.uuid);
                Ok(winner)
            }
        }
    }

    pub async fn placement(&self, network: &Network, host: Option<&str>) -> Result<Placement> {
        let host = self.authoritative_host(network, host).await?;
        if host == self.ctx.host {
            Ok(Placement::Local)
        } else {
            Ok(Placement::Remote(host))
        }
    }

    pub async fn dealloc_placement(
        &self,
        network: &Network,
        host: Option<&str>,
    ) -> Result<DeallocPlacement> {
        if network.multi_host {
            return Ok(match host {
                Some(h) if h == self.ctx.host => DeallocPlacement::Local,
                Some(h) if self.rpc.service_is_up(h).await => DeallocPlacement::Remote(h.to_string()),
                _ => {
                    warn!(
                        "network service of {host:?} is down, deallocating on network {} without teardown",
                        network.uuid
                    );
                    DeallocPlacement::LocalWithoutTeardown
                }
            });
        }
        Ok(match self.placement(network, None).await? {
            Placement::Local => DeallocPlacement::Local,
            Placement::Remote(h) => DeallocPlacement::Remote(h),
        })
    }

    /// Allocates on every network concurrently, in-process when this host
    /// owns the network and over RPC otherwise. All branches finish before
    /// the first error is returned.
    pub async fn allocate_fixed_ips<F, Fut>(
        &self,
        instance: &Instance,
        host: Option<&str>,
        networks: &[Network],
        requested: &[RequestedNetwork],
        vpn: bool,
        local: F,
    ) -> Result<Vec<Option<Ipv4Addr>>>
    where
        F: Fn(Network, Option<Ipv4Addr>) -> Fut,
        Fut: Future<Output = Result<Option<Ipv4Addr>>>,
    {
        let local = &local;
        let branches = networks.iter().map(|network| async move {
            let address = requested_address(requested, network);
            match self.placement(network, host).await? {
                Placement::Local => local(network.clone(), address).await,
                Placement::Remote(target) => {
                    self.rpc
                        .allocate_fixed_ip(&target, &instance.uuid, network.id, address, vpn)
                        .await
                }
            }
        })
        .collect::<Vec<_>>();
        join_barrier(self.ctx.config.max_concurrent_allocations, branches).await
    }
}
