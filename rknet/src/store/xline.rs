use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{DnsDomain, FixedIp, FloatingIp, Instance, Network, VirtualInterface};
use etcd_client::{Client, Compare, CompareOp, ConnectOptions, GetOptions, Txn, TxnOp};
use ipnetwork::IpNetwork;
use log::{debug, info, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use super::{FixedIpUpdate, Store, StoreError, has_cidr, served_by};
use crate::config::XlineConfig;

const RACE_RETRIES: usize = 10;
/// Default `max-txn-ops` of etcd and xline.
const MAX_TXN_OPS: usize = 128;

/// Store backed by xline/etcd. Conditional updates are transactions that
/// compare the row's `mod_revision`, retried on conflict.
pub struct XlineStore {
    cli: Arc<Mutex<Client>>,
    prefix: String,
}

impl XlineStore {
    pub async fn new(config: XlineConfig) -> Result<Self, StoreError> {
        let opts = if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            ConnectOptions::default().with_user(user.clone(), pass.clone())
        } else {
            ConnectOptions::default()
        };
        let cli = Client::connect(config.endpoints.clone(), Some(opts)).await?;
        info!("connected to xline at {:?}", config.endpoints);
        Ok(Self {
            cli: Arc::new(Mutex::new(cli)),
            prefix: config.prefix.trim_end_matches('/').to_string(),
        })
    }

    async fn cli(&self) -> tokio::sync::MutexGuard<'_, Client> {
        self.cli.lock().await
    }

    fn network_key(&self, id: i64) -> String {
        format!("{}/networks/{id:020}", self.prefix)
    }

    fn cidr_key(&self, cidr: &IpNetwork) -> String {
        format!("{}/network_cidrs/{}", self.prefix, cidr.to_string().replace('/', "_"))
    }

    fn fixed_ip_key(&self, address: Ipv4Addr) -> String {
        format!("{}/fixed_ips/{address}", self.prefix)
    }

    fn vif_key(&self, id: i64) -> String {
        format!("{}/vifs/{id:020}", self.prefix)
    }

    fn mac_key(&self, mac: &str) -> String {
        format!("{}/vif_macs/{mac}", self.prefix)
    }

    fn instance_key(&self, uuid: &str) -> String {
        format!("{}/instances/{uuid}", self.prefix)
    }

    fn dir(&self, kind: &str) -> String {
        format!("{}/{kind}/", self.prefix)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<(T, i64)>, StoreError> {
        let resp = self.cli().await.get(key, None).await?;
        match resp.kvs().first() {
            Some(kv) => Ok(Some((serde_json::from_slice(kv.value())?, kv.mod_revision()))),
            None => Ok(None),
        }
    }

    async fn list_json<T: DeserializeOwned>(&self, kind: &str) -> Result<Vec<(T, i64)>, StoreError> {
        let resp = self
            .cli()
            .await
            .get(self.dir(kind), Some(GetOptions::new().with_prefix()))
            .await?;
        let mut out = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            match serde_json::from_slice(kv.value()) {
                Ok(v) => out.push((v, kv.mod_revision())),
                Err(e) => warn!("Ignoring bad record {:?}: {e}", std::str::from_utf8(kv.key())),
            }
        }
        Ok(out)
    }

    async fn list<T: DeserializeOwned>(&self, kind: &str) -> Result<Vec<T>, StoreError> {
        Ok(self.list_json(kind).await?.into_iter().map(|(v, _)| v).collect())
    }

    async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let value = serde_json::to_vec(value)?;
        self.cli().await.put(key, value, None).await?;
        Ok(())
    }

    /// Writes `value` only if the key still has `mod_revision`.
    async fn cas<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        mod_revision: i64,
    ) -> Result<bool, StoreError> {
        let value = serde_json::to_vec(value)?;
        let txn = Txn::new()
            .when([Compare::mod_revision(key, CompareOp::Equal, mod_revision)])
            .and_then([TxnOp::put(key, value, None)]);
        Ok(self.cli().await.txn(txn).await?.succeeded())
    }

    /// Read-modify-write loop. `f` returns whether a write is needed.
    async fn modify<T, F>(
        &self,
        key: &str,
        missing: impl Fn() -> StoreError + Send,
        mut f: F,
    ) -> Result<T, StoreError>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnMut(&mut T) -> Result<bool, StoreError> + Send,
    {
        for _ in 0..RACE_RETRIES {
            let Some((mut value, rev)) = self.get_json::<T>(key).await? else {
                return Err(missing());
            };
            if !f(&mut value)? || self.cas(key, &value, rev).await? {
                return Ok(value);
            }
            debug!("conflict updating {key}, retrying");
        }
        Err(StoreError::TryAgain)
    }

    async fn next_id(&self, kind: &str) -> Result<i64, StoreError> {
        let key = format!("{}/ids/{kind}", self.prefix);
        for _ in 0..RACE_RETRIES {
            let (next, cmp) = match self.get_json::<i64>(&key).await? {
                Some((cur, rev)) => (cur + 1, Compare::mod_revision(key.as_str(), CompareOp::Equal, rev)),
                None => (1, Compare::version(key.as_str(), CompareOp::Equal, 0)),
            };
            let txn = Txn::new()
                .when([cmp])
                .and_then([TxnOp::put(key.as_str(), serde_json::to_vec(&next)?, None)]);
            if self.cli().await.txn(txn).await?.succeeded() {
                return Ok(next);
            }
        }
        Err(StoreError::TryAgain)
    }

    async fn modify_network<F>(&self, id: i64, f: F) -> Result<Network, StoreError>
    where
        F: FnMut(&mut Network) -> Result<bool, StoreError> + Send,
    {
        self.modify(&self.network_key(id), || StoreError::NetworkNotFound(id.to_string()), f)
            .await
    }

    async fn modify_fixed_ip<F>(&self, address: Ipv4Addr, f: F) -> Result<FixedIp, StoreError>
    where
        F: FnMut(&mut FixedIp) -> Result<bool, StoreError> + Send,
    {
        self.modify(&self.fixed_ip_key(address), || StoreError::FixedIpNotFound(address), f)
            .await
    }

    async fn associate(
        &self,
        project_id: &str,
        network_id: Option<i64>,
        force: bool,
    ) -> Result<Network, StoreError> {
        for _ in 0..RACE_RETRIES {
            let networks: Vec<(Network, i64)> = self.list_json("networks").await?;
            if !force
                && let Some((n, _)) = networks
                    .iter()
                    .find(|(n, _)| n.project_id.as_deref() == Some(project_id))
            {
                return Ok(n.clone());
            }
            let Some((mut network, rev)) = networks
                .into_iter()
                .find(|(n, _)| n.project_id.is_none() && network_id.is_none_or(|id| n.id == id))
            else {
                return Err(StoreError::NoMoreNetworks);
            };
            network.project_id = Some(project_id.to_string());
            network.updated_at = Some(Utc::now());
            if self.cas(&self.network_key(network.id), &network, rev).await? {
                return Ok(network);
            }
        }
        Err(StoreError::TryAgain)
    }

    /// Records an instance of the instance catalog.
    pub async fn put_instance(&self, instance: &Instance) -> Result<(), StoreError> {
        self.put_json(&self.instance_key(&instance.uuid), instance).await
    }

    pub async fn put_floating_ip(&self, floating_ip: &FloatingIp) -> Result<(), StoreError> {
        let key = format!("{}/floating_ips/{}", self.prefix, floating_ip.address);
        self.put_json(&key, floating_ip).await
    }

    pub async fn put_dns_domain(&self, domain: &DnsDomain) -> Result<(), StoreError> {
        let key = format!("{}/dns_domains/{}", self.prefix, domain.domain);
        self.put_json(&key, domain).await
    }
}

#[async_trait]
impl Store for XlineStore {
    async fn network_create_safe(&self, mut network: Network) -> Result<Option<Network>, StoreError> {
        network.id = self.next_id("networks").await?;
        let id = serde_json::to_vec(&network.id)?;
        let mut cmps = Vec::new();
        let mut ops = vec![TxnOp::put(
            self.network_key(network.id),
            serde_json::to_vec(&network)?,
            None,
        )];
        let cidrs = network
            .cidr
            .map(IpNetwork::V4)
            .into_iter()
            .chain(network.cidr_v6.map(IpNetwork::V6));
        for cidr in cidrs {
            let key = self.cidr_key(&cidr);
            cmps.push(Compare::version(key.as_str(), CompareOp::Equal, 0));
            ops.push(TxnOp::put(key, id.clone(), None));
        }
        let txn = Txn::new().when(cmps).and_then(ops);
        if self.cli().await.txn(txn).await?.succeeded() {
            Ok(Some(network))
        } else {
            Ok(None)
        }
    }

    async fn network_get(&self, id: i64) -> Result<Network, StoreError> {
        self.get_json(&self.network_key(id))
            .await?
            .map(|(n, _)| n)
            .ok_or_else(|| StoreError::NetworkNotFound(id.to_string()))
    }

    async fn network_get_by_uuid(&self, uuid: &str) -> Result<Network, StoreError> {
        self.list::<Network>("networks")
            .await?
            .into_iter()
            .find(|n| n.uuid == uuid)
            .ok_or_else(|| StoreError::NetworkNotFound(uuid.to_string()))
    }

    async fn network_get_by_cidr(&self, cidr: IpNetwork) -> Result<Network, StoreError> {
        self.list::<Network>("networks")
            .await?
            .into_iter()
            .find(|n| has_cidr(n, &cidr))
            .ok_or_else(|| StoreError::NetworkNotFound(cidr.to_string()))
    }

    async fn network_get_all(&self) -> Result<Vec<Network>, StoreError> {
        self.list("networks").await
    }

    async fn network_get_all_by_uuids(&self, uuids: &[String]) -> Result<Vec<Network>, StoreError> {
        let networks: Vec<Network> = self.list("networks").await?;
        uuids
            .iter()
            .map(|uuid| {
                networks
                    .iter()
                    .find(|n| &n.uuid == uuid)
                    .cloned()
                    .ok_or_else(|| StoreError::NetworkNotFound(uuid.clone()))
            })
            .collect()
    }

    async fn network_get_all_by_host(&self, host: &str) -> Result<Vec<Network>, StoreError> {
        let networks: Vec<Network> = self.list("networks").await?;
        let ips: Vec<FixedIp> = self.list("fixed_ips").await?;
        Ok(networks
            .into_iter()
            .filter(|n| {
                n.host.as_deref() == Some(host)
                    || ips
                        .iter()
                        .any(|ip| ip.network_id == n.id && ip.host.as_deref() == Some(host))
            })
            .collect())
    }

    async fn project_get_networks(
        &self,
        project_id: &str,
        associate: bool,
    ) -> Result<Vec<Network>, StoreError> {
        let networks: Vec<Network> = self
            .list::<Network>("networks")
            .await?
            .into_iter()
            .filter(|n| n.project_id.as_deref() == Some(project_id))
            .collect();
        if networks.is_empty() && associate {
            return Ok(vec![self.associate(project_id, None, false).await?]);
        }
        Ok(networks)
    }

    async fn network_associate(
        &self,
        project_id: &str,
        network_id: Option<i64>,
        force: bool,
    ) -> Result<Network, StoreError> {
        self.associate(project_id, network_id, force).await
    }

    async fn network_disassociate(
        &self,
        network_id: i64,
        disassociate_host: bool,
        disassociate_project: bool,
    ) -> Result<(), StoreError> {
        self.modify_network(network_id, |n| {
            if disassociate_host {
                n.host = None;
            }
            if disassociate_project {
                n.project_id = None;
            }
            n.updated_at = Some(Utc::now());
            Ok(true)
        })
        .await?;
        Ok(())
    }

    async fn network_set_host(&self, network_id: i64, host: &str) -> Result<String, StoreError> {
        let network = self
            .modify_network(network_id, |n| {
                if n.host.is_some() {
                    return Ok(false);
                }
                n.host = Some(host.to_string());
                Ok(true)
            })
            .await?;
        Ok(network.host.unwrap_or_else(|| host.to_string()))
    }

    async fn network_update(&self, network: &Network) -> Result<Network, StoreError> {
        self.modify_network(network.id, |n| {
            *n = network.clone();
            n.updated_at = Some(Utc::now());
            Ok(true)
        })
        .await
    }

    async fn network_delete_safe(&self, network_id: i64) -> Result<(), StoreError> {
        for _ in 0..RACE_RETRIES {
            let network_key = self.network_key(network_id);
            let Some((network, rev)) = self.get_json::<Network>(&network_key).await? else {
                return Err(StoreError::NetworkNotFound(network_id.to_string()));
            };
            let ips: Vec<FixedIp> = self
                .list::<FixedIp>("fixed_ips")
                .await?
                .into_iter()
                .filter(|ip| ip.network_id == network_id)
                .collect();
            if ips.iter().any(|ip| ip.allocated) {
                return Err(StoreError::NetworkInUse(network_id));
            }

            let mut ops = vec![TxnOp::delete(network_key.as_str(), None)];
            let cidrs = network
                .cidr
                .map(IpNetwork::V4)
                .into_iter()
                .chain(network.cidr_v6.map(IpNetwork::V6));
            for cidr in cidrs {
                ops.push(TxnOp::delete(self.cidr_key(&cidr), None));
            }
            let txn = Txn::new()
                .when([Compare::mod_revision(network_key.as_str(), CompareOp::Equal, rev)])
                .and_then(ops);
            if !self.cli().await.txn(txn).await?.succeeded() {
                continue;
            }

            // Allocation resolves the network row first, so the pool is
            // unreachable once the row is gone.
            for chunk in ips.chunks(MAX_TXN_OPS) {
                let ops: Vec<TxnOp> = chunk
                    .iter()
                    .map(|ip| TxnOp::delete(self.fixed_ip_key(ip.address), None))
                    .collect();
                self.cli().await.txn(Txn::new().and_then(ops)).await?;
            }
            debug!("deleted network {network_id} and {} fixed ips", ips.len());
            return Ok(());
        }
        Err(StoreError::TryAgain)
    }

    async fn network_in_use_on_host(&self, network_id: i64, host: &str) -> Result<bool, StoreError> {
        let ips: Vec<FixedIp> = self.list("fixed_ips").await?;
        for uuid in ips
            .iter()
            .filter(|ip| ip.network_id == network_id && ip.allocated)
            .filter_map(|ip| ip.instance_uuid.as_deref())
        {
            if let Some((instance, _)) = self.get_json::<Instance>(&self.instance_key(uuid)).await?
                && instance.host.as_deref() == Some(host)
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn fixed_ip_bulk_create(&self, ips: Vec<FixedIp>) -> Result<(), StoreError> {
        for mut ip in ips {
            ip.id = self.next_id("fixed_ips").await?;
            self.put_json(&self.fixed_ip_key(ip.address), &ip).await?;
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
        self.modify_fixed_ip(address, |ip| {
            if ip.network_id != network_id || ip.reserved != reserved {
                return Err(StoreError::FixedIpNotFound(address));
            }
            match &ip.instance_uuid {
                Some(owner) if owner == instance_uuid => Ok(false),
                Some(owner) => Err(StoreError::FixedIpAlreadyInUse {
                    address,
                    instance_uuid: owner.clone(),
                }),
                None => {
                    ip.instance_uuid = Some(instance_uuid.to_string());
                    ip.updated_at = Some(Utc::now());
                    Ok(true)
                }
            }
        })
        .await
    }

    async fn fixed_ip_associate_pool(
        &self,
        network_id: i64,
        instance_uuid: Option<&str>,
        host: Option<&str>,
    ) -> Result<FixedIp, StoreError> {
        for _ in 0..RACE_RETRIES {
            let Some((mut ip, rev)) = self
                .list_json::<FixedIp>("fixed_ips")
                .await?
                .into_iter()
                .filter(|(ip, _)| ip.network_id == network_id && ip.is_free())
                .min_by_key(|(ip, _)| ip.id)
            else {
                return Err(StoreError::NoMoreFixedIps(network_id));
            };
            if let Some(uuid) = instance_uuid {
                ip.instance_uuid = Some(uuid.to_string());
            }
            if let Some(host) = host {
                ip.host = Some(host.to_string());
            }
            ip.updated_at = Some(Utc::now());
            if self.cas(&self.fixed_ip_key(ip.address), &ip, rev).await? {
                return Ok(ip);
            }
            debug!("lost the race for {} on network {network_id}", ip.address);
        }
        Err(StoreError::TryAgain)
    }

    async fn fixed_ip_get_by_address(&self, address: Ipv4Addr) -> Result<FixedIp, StoreError> {
        self.get_json(&self.fixed_ip_key(address))
            .await?
            .map(|(ip, _)| ip)
            .ok_or(StoreError::FixedIpNotFound(address))
    }

    async fn fixed_ip_get_by_network_host(
        &self,
        network_id: i64,
        host: &str,
    ) -> Result<Option<FixedIp>, StoreError> {
        Ok(self
            .list::<FixedIp>("fixed_ips")
            .await?
            .into_iter()
            .find(|ip| ip.network_id == network_id && ip.host.as_deref() == Some(host)))
    }

    async fn fixed_ip_get_by_instance(&self, instance_uuid: &str) -> Result<Vec<FixedIp>, StoreError> {
        let mut ips: Vec<FixedIp> = self
            .list::<FixedIp>("fixed_ips")
            .await?
            .into_iter()
            .filter(|ip| ip.instance_uuid.as_deref() == Some(instance_uuid))
            .collect();
        ips.sort_by_key(|ip| ip.id);
        Ok(ips)
    }

    async fn fixed_ips_by_network(&self, network_id: i64) -> Result<Vec<FixedIp>, StoreError> {
        let mut ips: Vec<FixedIp> = self
            .list::<FixedIp>("fixed_ips")
            .await?
            .into_iter()
            .filter(|ip| ip.network_id == network_id)
            .collect();
        ips.sort_by_key(|ip| ip.id);
        Ok(ips)
    }

    async fn fixed_ips_by_virtual_interface(&self, vif_id: i64) -> Result<Vec<FixedIp>, StoreError> {
        let mut ips: Vec<FixedIp> = self
            .list::<FixedIp>("fixed_ips")
            .await?
            .into_iter()
            .filter(|ip| ip.virtual_interface_id == Some(vif_id))
            .collect();
        ips.sort_by_key(|ip| ip.id);
        Ok(ips)
    }

    async fn fixed_ip_update(
        &self,
        address: Ipv4Addr,
        update: &FixedIpUpdate,
    ) -> Result<FixedIp, StoreError> {
        self.modify_fixed_ip(address, |ip| {
            update.apply(ip);
            Ok(true)
        })
        .await
    }

    async fn fixed_ip_disassociate(&self, address: Ipv4Addr) -> Result<(), StoreError> {
        self.modify_fixed_ip(address, |ip| {
            ip.instance_uuid = None;
            ip.updated_at = Some(Utc::now());
            Ok(true)
        })
        .await?;
        Ok(())
    }

    async fn fixed_ip_disassociate_all_by_timeout(
        &self,
        host: &str,
        before: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let networks: Vec<Network> = self.list("networks").await?;
        let mut count = 0;
        for (mut ip, rev) in self.list_json::<FixedIp>("fixed_ips").await? {
            if ip.allocated || ip.updated_at.is_none_or(|t| t >= before) {
                continue;
            }
            let Some(uuid) = ip.instance_uuid.clone() else {
                continue;
            };
            let Some(network) = networks.iter().find(|n| n.id == ip.network_id) else {
                continue;
            };
            let instance = if network.multi_host {
                self.get_json::<Instance>(&self.instance_key(&uuid))
                    .await?
                    .map(|(i, _)| i)
            } else {
                None
            };
            if !served_by(network, instance.as_ref(), host) {
                continue;
            }
            ip.instance_uuid = None;
            ip.leased = false;
            ip.updated_at = Some(Utc::now());
            // A row touched since the listing is no longer stale.
            if self.cas(&self.fixed_ip_key(ip.address), &ip, rev).await? {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn virtual_interface_create(
        &self,
        mut vif: VirtualInterface,
    ) -> Result<VirtualInterface, StoreError> {
        vif.id = self.next_id("vifs").await?;
        let mac_key = self.mac_key(&vif.address);
        let txn = Txn::new()
            .when([Compare::version(mac_key.as_str(), CompareOp::Equal, 0)])
            .and_then([
                TxnOp::put(self.vif_key(vif.id), serde_json::to_vec(&vif)?, None),
                TxnOp::put(mac_key.as_str(), serde_json::to_vec(&vif.id)?, None),
            ]);
        if !self.cli().await.txn(txn).await?.succeeded() {
            return Err(StoreError::DuplicateMac(vif.address));
        }
        Ok(vif)
    }

    async fn virtual_interface_get(&self, id: i64) -> Result<Option<VirtualInterface>, StoreError> {
        Ok(self.get_json(&self.vif_key(id)).await?.map(|(v, _)| v))
    }

    async fn virtual_interface_get_all(&self) -> Result<Vec<VirtualInterface>, StoreError> {
        self.list("vifs").await
    }

    async fn virtual_interface_get_by_instance(
        &self,
        instance_uuid: &str,
    ) -> Result<Vec<VirtualInterface>, StoreError> {
        Ok(self
            .list::<VirtualInterface>("vifs")
            .await?
            .into_iter()
            .filter(|v| v.instance_uuid == instance_uuid)
            .collect())
    }

    async fn virtual_interface_get_by_instance_and_network(
        &self,
        instance_uuid: &str,
        network_id: i64,
    ) -> Result<Option<VirtualInterface>, StoreError> {
        Ok(self
            .list::<VirtualInterface>("vifs")
            .await?
            .into_iter()
            .find(|v| v.instance_uuid == instance_uuid && v.network_id == network_id))
    }

    async fn virtual_interface_delete_by_instance(&self, instance_uuid: &str) -> Result<(), StoreError> {
        let vifs = self.virtual_interface_get_by_instance(instance_uuid).await?;
        if vifs.is_empty() {
            return Ok(());
        }
        let ops: Vec<TxnOp> = vifs
            .iter()
            .flat_map(|v| {
                [
                    TxnOp::delete(self.vif_key(v.id), None),
                    TxnOp::delete(self.mac_key(&v.address), None),
                ]
            })
            .collect();
        self.cli().await.txn(Txn::new().and_then(ops)).await?;
        Ok(())
    }

    async fn instance_get_by_uuid(
        &self,
        uuid: &str,
        read_deleted: bool,
    ) -> Result<Instance, StoreError> {
        self.get_json::<Instance>(&self.instance_key(uuid))
            .await?
            .map(|(i, _)| i)
            .filter(|i| read_deleted || !i.deleted)
            .ok_or_else(|| StoreError::InstanceNotFound(uuid.to_string()))
    }

    async fn floating_ips_by_fixed_address(
        &self,
        address: Ipv4Addr,
    ) -> Result<Vec<FloatingIp>, StoreError> {
        Ok(self
            .list::<FloatingIp>("floating_ips")
            .await?
            .into_iter()
            .filter(|f| f.fixed_address == Some(address))
            .collect())
    }

    async fn dns_domain_get(&self, domain: &str) -> Result<Option<DnsDomain>, StoreError> {
        let key = format!("{}/dns_domains/{domain}", self.prefix);
        Ok(self.get_json(&key).await?.map(|(d, _)| d))
    }
}
