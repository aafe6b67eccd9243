//! Per-address state machine: allocate, lease, release, deallocate and the
//! reclamation of stale associations.

use std::net::Ipv4Addr;
use std::sync::LazyLock;

use chrono::{Duration, Utc};
use common::{FixedIp, Instance, Network};
use log::{debug, error, info, warn};
use regex::Regex;

use crate::context::NetworkContext;
use crate::store::FixedIpUpdate;
use crate::{NetworkError, Result};

static DNS_LABEL_INVALID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9-]+").expect("valid dns label pattern"));

/// Display names become DNS labels: runs of unsupported characters turn
/// into a single `-`.
pub fn dns_label(name: &str) -> String {
    DNS_LABEL_INVALID
        .replace_all(name, "-")
        .trim_matches('-')
        .to_lowercase()
}

pub struct FixedIpAllocator<'a> {
    ctx: &'a NetworkContext,
}

impl<'a> FixedIpAllocator<'a> {
    pub fn new(ctx: &'a NetworkContext) -> Self {
        Self { ctx }
    }

    fn dns_domain(&self) -> &str {
        self.ctx.config.instance_dns_domain.as_deref().unwrap_or_default()
    }

    /// Binds an address of `network` to the instance's interface on it.
    /// Returns `None` when the network has no v4 block.
    pub async fn allocate(
        &self,
        instance: &Instance,
        network: &Network,
        requested: Option<Ipv4Addr>,
        vpn: bool,
    ) -> Result<Option<Ipv4Addr>> {
        if network.cidr.is_none() {
            return Ok(None);
        }
        let store = &self.ctx.store;
        let vif = store
            .virtual_interface_get_by_instance_and_network(&instance.uuid, network.id)
            .await?
            .ok_or_else(|| NetworkError::VirtualInterfaceNotFound {
                instance_uuid: instance.uuid.clone(),
                network_id: network.id,
            })?;

        let fixed_ip = if vpn {
            let address = network.vpn_private_address.ok_or_else(|| {
                NetworkError::InvalidInput(format!("network {} has no vpn address", network.uuid))
            })?;
            store
                .fixed_ip_associate(address, &instance.uuid, network.id, true)
                .await?
        } else {
            let fixed_ip = match requested {
                Some(address) => {
                    store
                        .fixed_ip_associate(address, &instance.uuid, network.id, false)
                        .await?
                }
                None => {
                    store
                        .fixed_ip_associate_pool(network.id, Some(&instance.uuid), None)
                        .await?
                }
            };
            self.refresh_security_groups(instance, "instance_add_security_group")
                .await?;
            fixed_ip
        };

        let address = fixed_ip.address;
        store
            .fixed_ip_update(
                address,
                &FixedIpUpdate {
                    allocated: Some(true),
                    virtual_interface_id: Some(Some(vif.id)),
                    ..Default::default()
                },
            )
            .await?;

        if self.validate_instance_zone(instance).await? {
            let domain = self.dns_domain();
            let name = dns_label(&instance.display_name);
            if !name.is_empty() {
                self.ctx.dns.create_entry(&name, address, "A", domain).await?;
            }
            self.ctx
                .dns
                .create_entry(&instance.uuid, address, "A", domain)
                .await?;
        }
        info!("allocated {address} on network {} to instance {}", network.uuid, instance.uuid);
        Ok(Some(address))
    }

    /// Returns the address to the pool and yields the row as it was before.
    /// The instance is looked up including soft-deleted ones.
    pub async fn deallocate(&self, address: Ipv4Addr) -> Result<FixedIp> {
        let store = &self.ctx.store;
        let fixed_ip = store.fixed_ip_get_by_address(address).await?;
        let instance_uuid = fixed_ip
            .instance_uuid
            .as_deref()
            .ok_or(NetworkError::FixedIpNotAssociated(address))?;
        let instance = store.instance_get_by_uuid(instance_uuid, true).await?;

        self.refresh_security_groups(&instance, "instance_remove_security_group")
            .await?;

        if self.validate_instance_zone(&instance).await? {
            let domain = self.dns_domain();
            for name in self.ctx.dns.get_entries_by_address(address, domain).await? {
                self.ctx.dns.delete_entry(&name, domain).await?;
            }
        }

        store
            .fixed_ip_update(
                address,
                &FixedIpUpdate {
                    allocated: Some(false),
                    virtual_interface_id: Some(None),
                    ..Default::default()
                },
            )
            .await?;
        info!("deallocated {address} from instance {instance_uuid}");
        Ok(fixed_ip)
    }

    /// Sends a DHCP release for a deallocated address. Returns `false` when
    /// the interface data is gone, in which case teardown must be skipped.
    pub async fn force_dhcp_release(&self, network: &Network, prior: &FixedIp) -> Result<bool> {
        let Some(vif_id) = prior.virtual_interface_id else {
            error!("unable to release {} because vif doesn't exist", prior.address);
            return Ok(false);
        };
        let Some(vif) = self.ctx.store.virtual_interface_get(vif_id).await? else {
            error!("unable to release {} because vif {vif_id} doesn't exist", prior.address);
            return Ok(false);
        };
        let dev = self.ctx.device.get_dev(network).await?;
        self.ctx
            .device
            .release_dhcp(&dev, prior.address, &vif.address)
            .await?;
        Ok(true)
    }

    /// DHCP server callback for a granted lease.
    pub async fn lease(&self, address: Ipv4Addr) -> Result<()> {
        debug!("leased ip |{address}|");
        let fixed_ip = self.ctx.store.fixed_ip_get_by_address(address).await?;
        if fixed_ip.instance_uuid.is_none() {
            return Err(NetworkError::FixedIpNotAssociated(address));
        }
        self.ctx
            .store
            .fixed_ip_update(
                address,
                &FixedIpUpdate {
                    leased: Some(true),
                    ..Default::default()
                },
            )
            .await?;
        if !fixed_ip.allocated {
            warn!("ip |{address}| leased that isn't allocated");
        }
        Ok(())
    }

    /// DHCP server callback for a released lease. An address that is no
    /// longer allocated goes straight back to the pool.
    pub async fn release(&self, address: Ipv4Addr) -> Result<()> {
        debug!("released ip |{address}|");
        let store = &self.ctx.store;
        let fixed_ip = store.fixed_ip_get_by_address(address).await?;
        if fixed_ip.instance_uuid.is_none() {
            return Err(NetworkError::FixedIpNotAssociated(address));
        }
        if !fixed_ip.leased {
            warn!("ip |{address}| released that was not leased");
        }
        store
            .fixed_ip_update(
                address,
                &FixedIpUpdate {
                    leased: Some(false),
                    ..Default::default()
                },
            )
            .await?;
        if !fixed_ip.allocated {
            store.fixed_ip_disassociate(address).await?;
        }
        Ok(())
    }

    /// Disassociates addresses deallocated more than `timeout` ago on
    /// networks this host serves.
    pub async fn disassociate_stale(&self, timeout: Duration) -> Result<usize> {
        let before = Utc::now() - timeout;
        let count = self
            .ctx
            .store
            .fixed_ip_disassociate_all_by_timeout(&self.ctx.host, before)
            .await?;
        if count > 0 {
            debug!("disassociated {count} stale fixed ip(s)");
        }
        Ok(count)
    }

    /// Whether DNS entries should be managed for the instance: true unless
    /// the instance DNS domain is scoped to another availability zone.
    pub async fn validate_instance_zone(&self, instance: &Instance) -> Result<bool> {
        let Some(domain) = self.ctx.config.instance_dns_domain.as_deref() else {
            return Ok(true);
        };
        let Some(domain_ref) = self.ctx.store.dns_domain_get(domain).await? else {
            warn!("instance-dns-zone not found |{domain}|");
            return Ok(true);
        };
        match domain_ref.availability_zone {
            Some(zone) if Some(&zone) != instance.availability_zone.as_ref() => {
                warn!(
                    "instance {} is in zone {:?}, not in DNS zone {zone}",
                    instance.uuid, instance.availability_zone
                );
                Ok(false)
            }
            _ => Ok(true),
        }
    }

    async fn refresh_security_groups(&self, instance: &Instance, handler: &str) -> Result<()> {
        let sg = &self.ctx.security_groups;
        sg.trigger_members_refresh(&instance.security_groups).await?;
        for group in &instance.security_groups {
            sg.trigger_handler(handler, instance, group).await?;
        }
        Ok(())
    }
}
