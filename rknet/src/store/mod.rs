//! Persistence contract of the allocation service.
//!
//! Every method is a single logical operation. The ones documented as atomic
//! must not let two concurrent callers observe or claim the same row.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{DnsDomain, FixedIp, FloatingIp, Instance, Network, VirtualInterface};
use ipnetwork::IpNetwork;

pub mod memory;
pub mod xline;

pub use memory::MemoryStore;
pub use xline::XlineStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("network {0} not found")]
    NetworkNotFound(String),
    #[error("fixed ip {0} not found")]
    FixedIpNotFound(Ipv4Addr),
    #[error("instance {0} not found")]
    InstanceNotFound(String),
    #[error("fixed ip {address} is already in use by instance {instance_uuid}")]
    FixedIpAlreadyInUse {
        address: Ipv4Addr,
        instance_uuid: String,
    },
    #[error("zero fixed ips available in network {0}")]
    NoMoreFixedIps(i64),
    #[error("no more networks available")]
    NoMoreNetworks,
    #[error("network {0} still has allocated fixed ips")]
    NetworkInUse(i64),
    #[error("virtual interface with mac {0} already exists")]
    DuplicateMac(String),
    #[error("try again")]
    TryAgain,
    #[error(transparent)]
    Xline(#[from] Box<etcd_client::Error>),
    #[error(transparent)]
    Utf8(#[from] std::str::Utf8Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<etcd_client::Error> for StoreError {
    fn from(e: etcd_client::Error) -> Self {
        StoreError::Xline(Box::new(e))
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Inserts `network` unless a network with the same v4 or v6 cidr exists,
    /// in which case nothing is written and `None` is returned.
    async fn network_create_safe(&self, network: Network) -> Result<Option<Network>, StoreError>;

    async fn network_get(&self, id: i64) -> Result<Network, StoreError>;

    async fn network_get_by_uuid(&self, uuid: &str) -> Result<Network, StoreError>;

    async fn network_get_by_cidr(&self, cidr: IpNetwork) -> Result<Network, StoreError>;

    async fn network_get_all(&self) -> Result<Vec<Network>, StoreError>;

    /// Fails with `NetworkNotFound` naming the first missing uuid.
    async fn network_get_all_by_uuids(&self, uuids: &[String]) -> Result<Vec<Network>, StoreError>;

    /// Networks owned by `host`, plus networks where `host` holds a DHCP
    /// server address.
    async fn network_get_all_by_host(&self, host: &str) -> Result<Vec<Network>, StoreError>;

    /// Networks of a project. With `associate`, a project without networks
    /// is first given a free one.
    async fn project_get_networks(
        &self,
        project_id: &str,
        associate: bool,
    ) -> Result<Vec<Network>, StoreError>;

    /// Ties a project to `network_id`, or to any free network when `None`.
    /// Without `force`, a project that already has a network keeps it.
    async fn network_associate(
        &self,
        project_id: &str,
        network_id: Option<i64>,
        force: bool,
    ) -> Result<Network, StoreError>;

    async fn network_disassociate(
        &self,
        network_id: i64,
        disassociate_host: bool,
        disassociate_project: bool,
    ) -> Result<(), StoreError>;

    /// Atomically sets the owning host if unset. Returns the winning host.
    async fn network_set_host(&self, network_id: i64, host: &str) -> Result<String, StoreError>;

    async fn network_update(&self, network: &Network) -> Result<Network, StoreError>;

    /// Deletes a network and its fixed ips. Refuses while any address is
    /// allocated.
    async fn network_delete_safe(&self, network_id: i64) -> Result<(), StoreError>;

    /// Whether any allocated fixed ip of the network belongs to an instance
    /// on `host`.
    async fn network_in_use_on_host(&self, network_id: i64, host: &str) -> Result<bool, StoreError>;

    async fn fixed_ip_bulk_create(&self, ips: Vec<FixedIp>) -> Result<(), StoreError>;

    /// Atomically binds `address` to an instance. The row must belong to
    /// `network_id` and match `reserved`.
    async fn fixed_ip_associate(
        &self,
        address: Ipv4Addr,
        instance_uuid: &str,
        network_id: i64,
        reserved: bool,
    ) -> Result<FixedIp, StoreError>;

    /// Atomically claims one free, unreserved address of the network for an
    /// instance and/or a host.
    async fn fixed_ip_associate_pool(
        &self,
        network_id: i64,
        instance_uuid: Option<&str>,
        host: Option<&str>,
    ) -> Result<FixedIp, StoreError>;

    async fn fixed_ip_get_by_address(&self, address: Ipv4Addr) -> Result<FixedIp, StoreError>;

    async fn fixed_ip_get_by_network_host(
        &self,
        network_id: i64,
        host: &str,
    ) -> Result<Option<FixedIp>, StoreError>;

    async fn fixed_ip_get_by_instance(&self, instance_uuid: &str) -> Result<Vec<FixedIp>, StoreError>;

    async fn fixed_ips_by_network(&self, network_id: i64) -> Result<Vec<FixedIp>, StoreError>;

    async fn fixed_ips_by_virtual_interface(&self, vif_id: i64) -> Result<Vec<FixedIp>, StoreError>;

    /// Applies the set fields of `update` and bumps `updated_at`.
    async fn fixed_ip_update(
        &self,
        address: Ipv4Addr,
        update: &FixedIpUpdate,
    ) -> Result<FixedIp, StoreError>;

    async fn fixed_ip_disassociate(&self, address: Ipv4Addr) -> Result<(), StoreError>;

    /// Disassociates unallocated addresses last touched before `before` on
    /// networks served by `host`. Returns how many were released.
    async fn fixed_ip_disassociate_all_by_timeout(
        &self,
        host: &str,
        before: DateTime<Utc>,
    ) -> Result<usize, StoreError>;

    /// Fails with `DuplicateMac` when the address is taken.
    async fn virtual_interface_create(
        &self,
        vif: VirtualInterface,
    ) -> Result<VirtualInterface, StoreError>;

    async fn virtual_interface_get(&self, id: i64) -> Result<Option<VirtualInterface>, StoreError>;

    async fn virtual_interface_get_all(&self) -> Result<Vec<VirtualInterface>, StoreError>;

    async fn virtual_interface_get_by_instance(
        &self,
        instance_uuid: &str,
    ) -> Result<Vec<VirtualInterface>, StoreError>;

    async fn virtual_interface_get_by_instance_and_network(
        &self,
        instance_uuid: &str,
        network_id: i64,
    ) -> Result<Option<VirtualInterface>, StoreError>;

    async fn virtual_interface_delete_by_instance(&self, instance_uuid: &str) -> Result<(), StoreError>;

    /// With `read_deleted`, soft-deleted instances are returned too.
    async fn instance_get_by_uuid(
        &self,
        uuid: &str,
        read_deleted: bool,
    ) -> Result<Instance, StoreError>;

    async fn floating_ips_by_fixed_address(
        &self,
        address: Ipv4Addr,
    ) -> Result<Vec<FloatingIp>, StoreError>;

    async fn dns_domain_get(&self, domain: &str) -> Result<Option<DnsDomain>, StoreError>;
}

/// Field-wise change to a fixed ip. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FixedIpUpdate {
    pub allocated: Option<bool>,
    pub leased: Option<bool>,
    pub virtual_interface_id: Option<Option<i64>>,
    pub host: Option<Option<String>>,
}

impl FixedIpUpdate {
    pub fn apply(&self, ip: &mut FixedIp) {
        if let Some(allocated) = self.allocated {
            ip.allocated = allocated;
        }
        if let Some(leased) = self.leased {
            ip.leased = leased;
        }
        if let Some(vif) = self.virtual_interface_id {
            ip.virtual_interface_id = vif;
        }
        if let Some(host) = &self.host {
            ip.host = host.clone();
        }
        ip.updated_at = Some(Utc::now());
    }
}

pub(crate) fn same_cidr(a: &Network, b: &Network) -> bool {
    (a.cidr.is_some() && a.cidr == b.cidr) || (a.cidr_v6.is_some() && a.cidr_v6 == b.cidr_v6)
}

pub(crate) fn has_cidr(network: &Network, cidr: &IpNetwork) -> bool {
    match cidr {
        IpNetwork::V4(c) => network.cidr.as_ref() == Some(c),
        IpNetwork::V6(c) => network.cidr_v6.as_ref() == Some(c),
    }
}

/// Whether a stale fixed ip is reclaimable by `host`: single-host networks it
/// owns, or multi-host networks where the instance runs on it.
pub(crate) fn served_by(network: &Network, instance: Option<&Instance>, host: &str) -> bool {
    if network.multi_host {
        instance.and_then(|i| i.host.as_deref()) == Some(host)
    } else {
        network.host.as_deref() == Some(host)
    }
}
