use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{DnsDomain, FixedIp, FloatingIp, Instance, Network, VirtualInterface};
use ipnetwork::IpNetwork;
use tokio::sync::Mutex;

use super::{FixedIpUpdate, Store, StoreError, has_cidr, same_cidr, served_by};

#[derive(Default)]
struct State {
    next_id: i64,
    networks: BTreeMap<i64, Network>,
    fixed_ips: BTreeMap<i64, FixedIp>,
    vifs: BTreeMap<i64, VirtualInterface>,
    instances: HashMap<String, Instance>,
    floating_ips: Vec<FloatingIp>,
    dns_domains: HashMap<String, DnsDomain>,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn network(&self, id: i64) -> Result<&Network, StoreError> {
        self.networks
            .get(&id)
            .ok_or_else(|| StoreError::NetworkNotFound(id.to_string()))
    }

    fn network_mut(&mut self, id: i64) -> Result<&mut Network, StoreError> {
        self.networks
            .get_mut(&id)
            .ok_or_else(|| StoreError::NetworkNotFound(id.to_string()))
    }

    fn fixed_ip_mut(&mut self, address: Ipv4Addr) -> Result<&mut FixedIp, StoreError> {
        self.fixed_ips
            .values_mut()
            .find(|ip| ip.address == address)
            .ok_or(StoreError::FixedIpNotFound(address))
    }

    fn associate(
        &mut self,
        project_id: &str,
        network_id: Option<i64>,
        force: bool,
    ) -> Result<Network, StoreError> {
        if !force
            && let Some(n) = self
                .networks
                .values()
                .find(|n| n.project_id.as_deref() == Some(project_id))
        {
            return Ok(n.clone());
        }
        let network = self
            .networks
            .values_mut()
            .find(|n| n.project_id.is_none() && network_id.is_none_or(|id| n.id == id))
            .ok_or(StoreError::NoMoreNetworks)?;
        network.project_id = Some(project_id.to_string());
        network.updated_at = Some(Utc::now());
        Ok(network.clone())
    }
}

/// Single-process store. Each operation runs in one critical section, which
/// makes the conditional updates atomic.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_instance(&self, instance: Instance) {
        let mut state = self.state.lock().await;
        state.instances.insert(instance.uuid.clone(), instance);
    }

    /// Soft-deletes an instance, keeping it visible to read-deleted lookups.
    pub async fn delete_instance(&self, uuid: &str) {
        let mut state = self.state.lock().await;
        if let Some(instance) = state.instances.get_mut(uuid) {
            instance.deleted = true;
        }
    }

    pub async fn insert_floating_ip(&self, floating_ip: FloatingIp) {
        self.state.lock().await.floating_ips.push(floating_ip);
    }

    pub async fn insert_dns_domain(&self, domain: DnsDomain) {
        let mut state = self.state.lock().await;
        state.dns_domains.insert(domain.domain.clone(), domain);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn network_create_safe(&self, mut network: Network) -> Result<Option<Network>, StoreError> {
        let mut state = self.state.lock().await;
        if state.networks.values().any(|n| same_cidr(n, &network)) {
            return Ok(None);
        }
        network.id = state.next_id();
        state.networks.insert(network.id, network.clone());
        Ok(Some(network))
    }

    async fn network_get(&self, id: i64) -> Result<Network, StoreError> {
        self.state.lock().await.network(id).cloned()
    }

    async fn network_get_by_uuid(&self, uuid: &str) -> Result<Network, StoreError> {
        let state = self.state.lock().await;
        state
            .networks
            .values()
            .find(|n| n.uuid == uuid)
            .cloned()
            .ok_or_else(|| StoreError::NetworkNotFound(uuid.to_string()))
    }

    async fn network_get_by_cidr(&self, cidr: IpNetwork) -> Result<Network, StoreError> {
        let state = self.state.lock().await;
        state
            .networks
            .values()
            .find(|n| has_cidr(n, &cidr))
            .cloned()
            .ok_or_else(|| StoreError::NetworkNotFound(cidr.to_string()))
    }

    async fn network_get_all(&self) -> Result<Vec<Network>, StoreError> {
        Ok(self.state.lock().await.networks.values().cloned().collect())
    }

    async fn network_get_all_by_uuids(&self, uuids: &[String]) -> Result<Vec<Network>, StoreError> {
        let state = self.state.lock().await;
        uuids
            .iter()
            .map(|uuid| {
                state
                    .networks
                    .values()
                    .find(|n| &n.uuid == uuid)
                    .cloned()
                    .ok_or_else(|| StoreError::NetworkNotFound(uuid.clone()))
            })
            .collect()
    }

    async fn network_get_all_by_host(&self, host: &str) -> Result<Vec<Network>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .networks
            .values()
            .filter(|n| {
                n.host.as_deref() == Some(host)
                    || state
                        .fixed_ips
                        .values()
                        .any(|ip| ip.network_id == n.id && ip.host.as_deref() == Some(host))
            })
            .cloned()
            .collect())
    }

    async fn project_get_networks(
        &self,
        project_id: &str,
        associate: bool,
    ) -> Result<Vec<Network>, StoreError> {
        let mut state = self.state.lock().await;
        let networks: Vec<Network> = state
            .networks
            .values()
            .filter(|n| n.project_id.as_deref() == Some(project_id))
            .cloned()
            .collect();
        if networks.is_empty() && associate {
            return Ok(vec![state.associate(project_id, None, false)?]);
        }
        Ok(networks)
    }

    async fn network_associate(
        &self,
        project_id: &str,
        network_id: Option<i64>,
        force: bool,
    ) -> Result<Network, StoreError> {
        self.state.lock().await.associate(project_id, network_id, force)
    }

    async fn network_disassociate(
        &self,
        network_id: i64,
        disassociate_host: bool,
        disassociate_project: bool,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let network = state.network_mut(network_id)?;
        if disassociate_host {
            network.host = None;
        }
        if disassociate_project {
            network.project_id = None;
        }
        network.updated_at = Some(Utc::now());
        Ok(())
    }

    async fn network_set_host(&self, network_id: i64, host: &str) -> Result<String, StoreError> {
        let mut state = self.state.lock().await;
        let network = state.network_mut(network_id)?;
        Ok(network.host.get_or_insert_with(|| host.to_string()).clone())
    }

    async fn network_update(&self, network: &Network) -> Result<Network, StoreError> {
        let mut state = self.state.lock().await;
        let stored = state.network_mut(network.id)?;
        *stored = network.clone();
        stored.updated_at = Some(Utc::now());
        Ok(stored.clone())
    }

    async fn network_delete_safe(&self, network_id: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.network(network_id)?;
        if state
            .fixed_ips
            .values()
            .any(|ip| ip.network_id == network_id && ip.allocated)
        {
            return Err(StoreError::NetworkInUse(network_id));
        }
        state.fixed_ips.retain(|_, ip| ip.network_id != network_id);
        state.networks.remove(&network_id);
        Ok(())
    }

    async fn network_in_use_on_host(&self, network_id: i64, host: &str) -> Result<bool, StoreError> {
        let state = self.state.lock().await;
        Ok(state.fixed_ips.values().any(|ip| {
            ip.network_id == network_id
                && ip.allocated
                && ip
                    .instance_uuid
                    .as_ref()
                    .and_then(|uuid| state.instances.get(uuid))
                    .is_some_and(|i| i.host.as_deref() == Some(host))
        }))
    }

    async fn fixed_ip_bulk_create(&self, ips: Vec<FixedIp>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        for mut ip in ips {
            ip.id = state.next_id();
            state.fixed_ips.insert(ip.id, ip);
        }
        Ok(())
    }

    async fn fixed_ip_associate(
        &self,
        address: Ipv4Addr,
        instance_uuid: &str,
        network_id: i64,
        reserved: bool,
    ) -> Result<FixedIp, StoreError> {
        let mut state = self.state.lock().await;
        let ip = state
            .fixed_ips
            .values_mut()
            .find(|ip| ip.address == address && ip.network_id == network_id && ip.reserved == reserved)
            .ok_or(StoreError::FixedIpNotFound(address))?;
        match &ip.instance_uuid {
            Some(owner) if owner != instance_uuid => Err(StoreError::FixedIpAlreadyInUse {
                address,
                instance_uuid: owner.clone(),
            }),
            _ => {
                ip.instance_uuid = Some(instance_uuid.to_string());
                ip.updated_at = Some(Utc::now());
                Ok(ip.clone())
            }
        }
    }

    async fn fixed_ip_associate_pool(
        &self,
        network_id: i64,
        instance_uuid: Option<&str>,
        host: Option<&str>,
    ) -> Result<FixedIp, StoreError> {
        let mut state = self.state.lock().await;
        let ip = state
            .fixed_ips
            .values_mut()
            .find(|ip| ip.network_id == network_id && ip.is_free())
            .ok_or(StoreError::NoMoreFixedIps(network_id))?;
        if let Some(uuid) = instance_uuid {
            ip.instance_uuid = Some(uuid.to_string());
        }
        if let Some(host) = host {
            ip.host = Some(host.to_string());
        }
        ip.updated_at = Some(Utc::now());
        Ok(ip.clone())
    }

    async fn fixed_ip_get_by_address(&self, address: Ipv4Addr) -> Result<FixedIp, StoreError> {
        let state = self.state.lock().await;
        state
            .fixed_ips
            .values()
            .find(|ip| ip.address == address)
            .cloned()
            .ok_or(StoreError::FixedIpNotFound(address))
    }

    async fn fixed_ip_get_by_network_host(
        &self,
        network_id: i64,
        host: &str,
    ) -> Result<Option<FixedIp>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .fixed_ips
            .values()
            .find(|ip| ip.network_id == network_id && ip.host.as_deref() == Some(host))
            .cloned())
    }

    async fn fixed_ip_get_by_instance(&self, instance_uuid: &str) -> Result<Vec<FixedIp>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .fixed_ips
            .values()
            .filter(|ip| ip.instance_uuid.as_deref() == Some(instance_uuid))
            .cloned()
            .collect())
    }

    async fn fixed_ips_by_network(&self, network_id: i64) -> Result<Vec<FixedIp>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .fixed_ips
            .values()
            .filter(|ip| ip.network_id == network_id)
            .cloned()
            .collect())
    }

    async fn fixed_ips_by_virtual_interface(&self, vif_id: i64) -> Result<Vec<FixedIp>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .fixed_ips
            .values()
            .filter(|ip| ip.virtual_interface_id == Some(vif_id))
            .cloned()
            .collect())
    }

    async fn fixed_ip_update(
        &self,
        address: Ipv4Addr,
        update: &FixedIpUpdate,
    ) -> Result<FixedIp, StoreError> {
        let mut state = self.state.lock().await;
        let ip = state.fixed_ip_mut(address)?;
        update.apply(ip);
        Ok(ip.clone())
    }

    async fn fixed_ip_disassociate(&self, address: Ipv4Addr) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let ip = state.fixed_ip_mut(address)?;
        ip.instance_uuid = None;
        ip.updated_at = Some(Utc::now());
        Ok(())
    }

    async fn fixed_ip_disassociate_all_by_timeout(
        &self,
        host: &str,
        before: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let now = Utc::now();
        let mut count = 0;
        for ip in state.fixed_ips.values_mut() {
            if ip.allocated || ip.updated_at.is_none_or(|t| t >= before) {
                continue;
            }
            let Some(uuid) = ip.instance_uuid.as_ref() else {
                continue;
            };
            let Some(network) = state.networks.get(&ip.network_id) else {
                continue;
            };
            if !served_by(network, state.instances.get(uuid), host) {
                continue;
            }
            ip.instance_uuid = None;
            ip.leased = false;
            ip.updated_at = Some(now);
            count += 1;
        }
        Ok(count)
    }

    async fn virtual_interface_create(
        &self,
        mut vif: VirtualInterface,
    ) -> Result<VirtualInterface, StoreError> {
        let mut state = self.state.lock().await;
        if state.vifs.values().any(|v| v.address == vif.address) {
            return Err(StoreError::DuplicateMac(vif.address));
        }
        vif.id = state.next_id();
        state.vifs.insert(vif.id, vif.clone());
        Ok(vif)
    }

    async fn virtual_interface_get(&self, id: i64) -> Result<Option<VirtualInterface>, StoreError> {
        Ok(self.state.lock().await.vifs.get(&id).cloned())
    }

    async fn virtual_interface_get_all(&self) -> Result<Vec<VirtualInterface>, StoreError> {
        Ok(self.state.lock().await.vifs.values().cloned().collect())
    }

    async fn virtual_interface_get_by_instance(
        &self,
        instance_uuid: &str,
    ) -> Result<Vec<VirtualInterface>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .vifs
            .values()
            .filter(|v| v.instance_uuid == instance_uuid)
            .cloned()
            .collect())
    }

    async fn virtual_interface_get_by_instance_and_network(
        &self,
        instance_uuid: &str,
        network_id: i64,
    ) -> Result<Option<VirtualInterface>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .vifs
            .values()
            .find(|v| v.instance_uuid == instance_uuid && v.network_id == network_id)
            .cloned())
    }

    async fn virtual_interface_delete_by_instance(&self, instance_uuid: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.vifs.retain(|_, v| v.instance_uuid != instance_uuid);
        Ok(())
    }

    async fn instance_get_by_uuid(
        &self,
        uuid: &str,
        read_deleted: bool,
    ) -> Result<Instance, StoreError> {
        let state = self.state.lock().await;
        state
            .instances
            .get(uuid)
            .filter(|i| read_deleted || !i.deleted)
            .cloned()
            .ok_or_else(|| StoreError::InstanceNotFound(uuid.to_string()))
    }

    async fn floating_ips_by_fixed_address(
        &self,
        address: Ipv4Addr,
    ) -> Result<Vec<FloatingIp>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .floating_ips
            .iter()
            .filter(|f| f.fixed_address == Some(address))
            .cloned()
            .collect())
    }

    async fn dns_domain_get(&self, domain: &str) -> Result<Option<DnsDomain>, StoreError> {
        Ok(self.state.lock().await.dns_domains.get(domain).cloned())
    }
}
