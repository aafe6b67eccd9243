#![allow(dead_code)]

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ::common::{DnsDomain, FixedIp, FloatingIp, Instance, Network, VirtualInterface};
use ipnetwork::{IpNetwork, Ipv4Network};
use rknet::config::NetworkConfig;
use rknet::context::{Drivers, NetworkContext};
use rknet::driver::{DeviceDriver, DhcpHost, L3Driver, LoggingDeviceDriver, MemoryDns, SecurityGroupApi};
use rknet::rpc::{NetworkRequest, NetworkResponse, NetworkRpc, RpcHandler};
use rknet::store::{FixedIpUpdate, MemoryStore, Store, StoreError};
use rknet::topology::TopologyKind;
use rknet::{NetworkError, NetworkManager};

static INIT: Once = Once::new();

pub fn init_logger() {
    INIT.call_once(|| {
        let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug"))
            .is_test(true)
            .try_init();
    });
}

/// Delivers calls straight to the handlers of in-process hosts. Hosts that
/// were never registered are down.
#[derive(Default)]
pub struct LoopbackRpc {
    peers: Mutex<HashMap<String, Arc<dyn RpcHandler>>>,
    calls: Mutex<Vec<(String, NetworkRequest)>>,
}

impl LoopbackRpc {
    pub fn register(&self, host: &str, handler: Arc<dyn RpcHandler>) {
        self.peers.lock().unwrap().insert(host.to_string(), handler);
    }

    pub fn calls(&self) -> Vec<(String, NetworkRequest)> {
        self.calls.lock().unwrap().clone()
    }

    async fn call(&self, host: &str, request: NetworkRequest) -> Result<NetworkResponse, NetworkError> {
        self.calls
            .lock()
            .unwrap()
            .push((host.to_string(), request.clone()));
        let handler = self.peers.lock().unwrap().get(host).cloned();
        let Some(handler) = handler else {
            return Err(NetworkError::Rpc {
                host: host.to_string(),
                source: anyhow::anyhow!("host is down"),
            });
        };
        match handler.handle(request).await {
            NetworkResponse::Error(message) => Err(NetworkError::Remote {
                host: host.to_string(),
                message,
            }),
            response => Ok(response),
        }
    }
}

#[async_trait]
impl NetworkRpc for LoopbackRpc {
    async fn allocate_fixed_ip(
        &self,
        host: &str,
        instance_uuid: &str,
        network_id: i64,
        address: Option<Ipv4Addr>,
        vpn: bool,
    ) -> Result<Option<Ipv4Addr>, NetworkError> {
        let request = NetworkRequest::AllocateFixedIp {
            instance_uuid: instance_uuid.to_string(),
            network_id,
            address,
            vpn,
        };
        match self.call(host, request).await? {
            NetworkResponse::Address(address) => Ok(address),
            other => panic!("unexpected response {other:?}"),
        }
    }

    async fn deallocate_fixed_ip(
        &self,
        host: &str,
        address: Ipv4Addr,
        instance_host: Option<&str>,
    ) -> Result<(), NetworkError> {
        let request = NetworkRequest::DeallocateFixedIp {
            address,
            host: instance_host.map(str::to_string),
        };
        self.call(host, request).await.map(|_| ())
    }

    async fn setup_network_on_host(
        &self,
        host: &str,
        network_id: i64,
        teardown: bool,
    ) -> Result<(), NetworkError> {
        let request = NetworkRequest::SetupNetworkOnHost {
            network_id,
            teardown,
        };
        self.call(host, request).await.map(|_| ())
    }

    async fn update_dns(&self, network_ids: &[i64]) {
        let hosts: Vec<String> = self.peers.lock().unwrap().keys().cloned().collect();
        for host in hosts {
            let request = NetworkRequest::UpdateDns {
                network_ids: network_ids.to_vec(),
            };
            let _ = self.call(&host, request).await;
        }
    }

    async fn service_is_up(&self, host: &str) -> bool {
        self.peers.lock().unwrap().contains_key(host)
    }
}

/// Records what the topologies asked of the host devices.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Recorder {
    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

#[async_trait]
impl DeviceDriver for Recorder {
    async fn get_dev(&self, network: &Network) -> anyhow::Result<String> {
        LoggingDeviceDriver.get_dev(network).await
    }

    async fn update_dhcp(&self, dev: &str, _network: &Network, dhcp_server: Ipv4Addr) -> anyhow::Result<()> {
        self.push(format!("update_dhcp {dev} {dhcp_server}"));
        Ok(())
    }

    async fn update_dns(&self, dev: &str, _network: &Network) -> anyhow::Result<()> {
        self.push(format!("update_dns {dev}"));
        Ok(())
    }

    async fn update_ra(&self, dev: &str, _network: &Network) -> anyhow::Result<()> {
        self.push(format!("update_ra {dev}"));
        Ok(())
    }

    async fn release_dhcp(&self, dev: &str, address: Ipv4Addr, mac: &str) -> anyhow::Result<()> {
        self.push(format!("release_dhcp {dev} {address} {mac}"));
        Ok(())
    }

    async fn kill_dhcp(&self, dev: &str) -> anyhow::Result<()> {
        self.push(format!("kill_dhcp {dev}"));
        Ok(())
    }

    async fn get_dhcp_leases(&self, network: &Network, hosts: &[DhcpHost]) -> anyhow::Result<String> {
        LoggingDeviceDriver.get_dhcp_leases(network, hosts).await
    }

    async fn link_local_address(&self, _dev: &str) -> anyhow::Result<Ipv6Addr> {
        Ok("fe80::1".parse()?)
    }
}

#[async_trait]
impl L3Driver for Recorder {
    async fn initialize(&self, _fixed_range: Option<Ipv4Network>, networks: &[Network]) -> anyhow::Result<()> {
        self.push(format!("initialize {}", networks.len()));
        Ok(())
    }

    async fn initialize_gateway(&self, network: &Network, dhcp_server: Ipv4Addr) -> anyhow::Result<()> {
        self.push(format!("initialize_gateway {} {dhcp_server}", network.uuid));
        Ok(())
    }

    async fn add_vpn(&self, public_ip: Ipv4Addr, port: u16, private_ip: Ipv4Addr) -> anyhow::Result<()> {
        self.push(format!("add_vpn {public_ip}:{port} {private_ip}"));
        Ok(())
    }

    async fn remove_gateway(&self, network: &Network) -> anyhow::Result<()> {
        self.push(format!("remove_gateway {}", network.uuid));
        Ok(())
    }
}

#[async_trait]
impl SecurityGroupApi for Recorder {
    async fn trigger_members_refresh(&self, groups: &[String]) -> anyhow::Result<()> {
        self.push(format!("members_refresh {}", groups.join(",")));
        Ok(())
    }

    async fn trigger_handler(&self, handler: &str, instance: &Instance, group: &str) -> anyhow::Result<()> {
        self.push(format!("{handler} {} {group}", instance.uuid));
        Ok(())
    }
}

pub struct Host {
    pub name: String,
    pub manager: Arc<NetworkManager>,
    pub recorder: Arc<Recorder>,
    pub dns: Arc<MemoryDns>,
}

/// Builds a network host on a shared store and registers it with `rpc`.
pub fn host(
    name: &str,
    kind: TopologyKind,
    config: NetworkConfig,
    store: Arc<dyn Store>,
    rpc: &Arc<LoopbackRpc>,
) -> Host {
    init_logger();
    let recorder = Arc::new(Recorder::default());
    let dns = Arc::new(MemoryDns::new());
    let drivers = Drivers {
        device: recorder.clone(),
        l3: recorder.clone(),
        dns: dns.clone(),
        security_groups: recorder.clone(),
    };
    let ctx = NetworkContext::new(name, config, store, drivers);
    let manager = Arc::new(NetworkManager::new(kind, ctx, rpc.clone()));
    rpc.register(name, manager.clone());
    Host {
        name: name.to_string(),
        manager,
        recorder,
        dns,
    }
}

pub fn flat_config() -> NetworkConfig {
    NetworkConfig {
        flat_network_bridge: Some("br100".to_string()),
        flat_interface: Some("eth0".to_string()),
        ..Default::default()
    }
}

pub fn instance(uuid: &str, project_id: &str, host: Option<&str>) -> Instance {
    Instance {
        uuid: uuid.to_string(),
        display_name: format!("vm {uuid}"),
        host: host.map(str::to_string),
        project_id: project_id.to_string(),
        security_groups: vec!["default".to_string()],
        ..Default::default()
    }
}

/// Memory store whose vif inserts fail as duplicates once `allowed`
/// inserts have gone through.
pub struct CollidingMacStore {
    pub inner: MemoryStore,
    allowed: usize,
    pub attempts: AtomicUsize,
}

impl CollidingMacStore {
    pub fn new(allowed: usize) -> Self {
        Self {
            inner: MemoryStore::new(),
            allowed,
            attempts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Store for CollidingMacStore {
    async fn network_create_safe(&self, network: Network) -> Result<Option<Network>, StoreError> {
        self.inner.network_create_safe(network).await
    }

    async fn network_get(&self, id: i64) -> Result<Network, StoreError> {
        self.inner.network_get(id).await
    }

    async fn network_get_by_uuid(&self, uuid: &str) -> Result<Network, StoreError> {
        self.inner.network_get_by_uuid(uuid).await
    }

    async fn network_get_by_cidr(&self, cidr: IpNetwork) -> Result<Network, StoreError> {
        self.inner.network_get_by_cidr(cidr).await
    }

    async fn network_get_all(&self) -> Result<Vec<Network>, StoreError> {
        self.inner.network_get_all().await
    }

    async fn network_get_all_by_uuids(&self, uuids: &[String]) -> Result<Vec<Network>, StoreError> {
        self.inner.network_get_all_by_uuids(uuids).await
    }

    async fn network_get_all_by_host(&self, host: &str) -> Result<Vec<Network>, StoreError> {
        self.inner.network_get_all_by_host(host).await
    }

    async fn project_get_networks(
        &self,
        project_id: &str,
        associate: bool,
    ) -> Result<Vec<Network>, StoreError> {
        self.inner.project_get_networks(project_id, associate).await
    }

    async fn network_associate(
        &self,
        project_id: &str,
        network_id: Option<i64>,
        force: bool,
    ) -> Result<Network, StoreError> {
        self.inner.network_associate(project_id, network_id, force).await
    }

    async fn network_disassociate(
        &self,
        network_id: i64,
        disassociate_host: bool,
        disassociate_project: bool,
    ) -> Result<(), StoreError> {
        self.inner
            .network_disassociate(network_id, disassociate_host, disassociate_project)
            .await
    }

    async fn network_set_host(&self, network_id: i64, host: &str) -> Result<String, StoreError> {
        self.inner.network_set_host(network_id, host).await
    }

    async fn network_update(&self, network: &Network) -> Result<Network, StoreError> {
        self.inner.network_update(network).await
    }

    async fn network_delete_safe(&self, network_id: i64) -> Result<(), StoreError> {
        self.inner.network_delete_safe(network_id).await
    }

    async fn network_in_use_on_host(&self, network_id: i64, host: &str) -> Result<bool, StoreError> {
        self.inner.network_in_use_on_host(network_id, host).await
    }

    async fn fixed_ip_bulk_create(&self, ips: Vec<FixedIp>) -> Result<(), StoreError> {
        self.inner.fixed_ip_bulk_create(ips).await
    }

    async fn fixed_ip_associate(
        &self,
        address: Ipv4Addr,
        instance_uuid: &str,
        network_id: i64,
        reserved: bool,
    ) -> Result<FixedIp, StoreError> {
        self.inner
            .fixed_ip_associate(address, instance_uuid, network_id, reserved)
            .await
    }

    async fn fixed_ip_associate_pool(
        &self,
        network_id: i64,
        instance_uuid: Option<&str>,
        host: Option<&str>,
    ) -> Result<FixedIp, StoreError> {
        self.inner
            .fixed_ip_associate_pool(network_id, instance_uuid, host)
            .await
    }

    async fn fixed_ip_get_by_address(&self, address: Ipv4Addr) -> Result<FixedIp, StoreError> {
        self.inner.fixed_ip_get_by_address(address).await
    }

    async fn fixed_ip_get_by_network_host(
        &self,
        network_id: i64,
        host: &str,
    ) -> Result<Option<FixedIp>, StoreError> {
        self.inner.fixed_ip_get_by_network_host(network_id, host).await
    }

    async fn fixed_ip_get_by_instance(&self, instance_uuid: &str) -> Result<Vec<FixedIp>, StoreError> {
        self.inner.fixed_ip_get_by_instance(instance_uuid).await
    }

    async fn fixed_ips_by_network(&self, network_id: i64) -> Result<Vec<FixedIp>, StoreError> {
        self.inner.fixed_ips_by_network(network_id).await
    }

    async fn fixed_ips_by_virtual_interface(&self, vif_id: i64) -> Result<Vec<FixedIp>, StoreError> {
        self.inner.fixed_ips_by_virtual_interface(vif_id).await
    }

    async fn fixed_ip_update(
        &self,
        address: Ipv4Addr,
        update: &FixedIpUpdate,
    ) -> Result<FixedIp, StoreError> {
        self.inner.fixed_ip_update(address, update).await
    }

    async fn fixed_ip_disassociate(&self, address: Ipv4Addr) -> Result<(), StoreError> {
        self.inner.fixed_ip_disassociate(address).await
    }

    async fn fixed_ip_disassociate_all_by_timeout(
        &self,
        host: &str,
        before: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        self.inner.fixed_ip_disassociate_all_by_timeout(host, before).await
    }

    async fn virtual_interface_create(
        &self,
        vif: VirtualInterface,
    ) -> Result<VirtualInterface, StoreError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt >= self.allowed {
            return Err(StoreError::DuplicateMac(vif.address));
        }
        self.inner.virtual_interface_create(vif).await
    }

    async fn virtual_interface_get(&self, id: i64) -> Result<Option<VirtualInterface>, StoreError> {
        self.inner.virtual_interface_get(id).await
    }

    async fn virtual_interface_get_all(&self) -> Result<Vec<VirtualInterface>, StoreError> {
        self.inner.virtual_interface_get_all().await
    }

    async fn virtual_interface_get_by_instance(
        &self,
        instance_uuid: &str,
    ) -> Result<Vec<VirtualInterface>, StoreError> {
        self.inner.virtual_interface_get_by_instance(instance_uuid).await
    }

    async fn virtual_interface_get_by_instance_and_network(
        &self,
        instance_uuid: &str,
        network_id: i64,
    ) -> Result<Option<VirtualInterface>, StoreError> {
        self.inner
            .virtual_interface_get_by_instance_and_network(instance_uuid, network_id)
            .await
    }

    async fn virtual_interface_delete_by_instance(&self, instance_uuid: &str) -> Result<(), StoreError> {
        self.inner.virtual_interface_delete_by_instance(instance_uuid).await
    }

    async fn instance_get_by_uuid(
        &self,
        uuid: &str,
        read_deleted: bool,
    ) -> Result<Instance, StoreError> {
        self.inner.instance_get_by_uuid(uuid, read_deleted).await
    }

    async fn floating_ips_by_fixed_address(
        &self,
        address: Ipv4Addr,
    ) -> Result<Vec<FloatingIp>, StoreError> {
        self.inner.floating_ips_by_fixed_address(address).await
    }

    async fn dns_domain_get(&self, domain: &str) -> Result<Option<DnsDomain>, StoreError> {
        self.inner.dns_domain_get(domain).await
    }
}
