use std::sync::Arc;

use crate::config::NetworkConfig;
use crate::driver::{
    DeviceDriver, DnsManager, L3Driver, LoggingDeviceDriver, LoggingL3Driver,
    LoggingSecurityGroups, MemoryDns, SecurityGroupApi,
};
use crate::lock::KeyedLocks;
use crate::store::Store;

/// Host-side collaborators injected into the manager.
#[derive(Clone)]
pub struct Drivers {
    pub device: Arc<dyn DeviceDriver>,
    pub l3: Arc<dyn L3Driver>,
    pub dns: Arc<dyn DnsManager>,
    pub security_groups: Arc<dyn SecurityGroupApi>,
}

impl Default for Drivers {
    fn default() -> Self {
        Drivers {
            device: Arc::new(LoggingDeviceDriver),
            l3: Arc::new(LoggingL3Driver),
            dns: Arc::new(MemoryDns::new()),
            security_groups: Arc::new(LoggingSecurityGroups),
        }
    }
}

/// Everything a topology needs on this host, shared by reference.
pub struct NetworkContext {
    pub host: String,
    pub config: Arc<NetworkConfig>,
    pub store: Arc<dyn Store>,
    pub device: Arc<dyn DeviceDriver>,
    pub l3: Arc<dyn L3Driver>,
    pub dns: Arc<dyn DnsManager>,
    pub security_groups: Arc<dyn SecurityGroupApi>,
    pub locks: KeyedLocks,
}

impl NetworkContext {
    pub fn new(
        host: impl Into<String>,
        config: NetworkConfig,
        store: Arc<dyn Store>,
        drivers: Drivers,
    ) -> Arc<Self> {
        Arc::new(NetworkContext {
            host: host.into(),
            config: Arc::new(config),
            store,
            device: drivers.device,
            l3: drivers.l3,
            dns: drivers.dns,
            security_groups: drivers.security_groups,
            locks: KeyedLocks::new(),
        })
    }
}
