use std::net::Ipv4Addr;

use common::Network;
use log::debug;

use crate::context::NetworkContext;
use crate::{NetworkError, Result};

/// Address the DHCP server of `network` answers from on `host`.
///
/// Single-host networks, and every network when the address is shared, use
/// the gateway. Otherwise each host holds one fixed ip of its own, claimed
/// from the pool on first use.
pub async fn get_dhcp_ip(ctx: &NetworkContext, network: &Network, host: &str) -> Result<Ipv4Addr> {
    let _guard = ctx.locks.lock("get_dhcp", network.id).await;
    if !network.multi_host || ctx.config.share_dhcp_address {
        return network.gateway.ok_or_else(|| {
            NetworkError::InvalidInput(format!("network {} has no gateway", network.uuid))
        });
    }
    if let Some(ip) = ctx
        .store
        .fixed_ip_get_by_network_host(network.id, host)
        .await?
    {
        return Ok(ip.address);
    }
    let ip = ctx
        .store
        .fixed_ip_associate_pool(network.id, None, Some(host))
        .await?;
    debug!("claimed {} as dhcp address of {host} on network {}", ip.address, network.uuid);
    Ok(ip.address)
}

/// Refreshes the DHCP server and, with IPv6, router advertisements. The
/// network's v6 gateway becomes the bridge's link-local address.
pub(crate) async fn update_dhcp_and_ra(
    ctx: &NetworkContext,
    network: &Network,
    dhcp_server: Ipv4Addr,
) -> Result<()> {
    if ctx.config.fake_network {
        return Ok(());
    }
    let dev = ctx.device.get_dev(network).await?;
    ctx.device.update_dhcp(&dev, network, dhcp_server).await?;
    if ctx.config.use_ipv6 {
        ctx.device.update_ra(&dev, network).await?;
        let gateway = ctx.device.link_local_address(&dev).await?;
        let mut updated = network.clone();
        updated.gateway_v6 = Some(gateway);
        ctx.store.network_update(&updated).await?;
    }
    Ok(())
}
