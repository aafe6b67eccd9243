use common::VirtualInterface;
use libipam::mac::{format_mac, generate_mac_address};
use log::{error, warn};

use crate::store::{Store, StoreError};
use crate::{NetworkError, Result};

/// Creates virtual interfaces with random, store-unique MAC addresses.
pub struct MacAddressAllocator<'a> {
    store: &'a dyn Store,
    attempts: u32,
}

impl<'a> MacAddressAllocator<'a> {
    pub fn new(store: &'a dyn Store, attempts: u32) -> Self {
        Self {
            store,
            attempts: attempts.max(1),
        }
    }

    /// Persists one VIF linking `instance_uuid` to `network_id`, regenerating
    /// the MAC on collisions. When every attempt collides, all VIFs of the
    /// instance are removed before failing.
    pub async fn create(&self, instance_uuid: &str, network_id: i64) -> Result<VirtualInterface> {
        for attempt in 1..=self.attempts {
            let vif = VirtualInterface {
                id: 0,
                uuid: uuid::Uuid::new_v4().to_string(),
                address: format_mac(&generate_mac_address()),
                instance_uuid: instance_uuid.to_string(),
                network_id,
            };
            match self.store.virtual_interface_create(vif).await {
                Ok(vif) => return Ok(vif),
                Err(StoreError::DuplicateMac(mac)) => {
                    warn!("mac {mac} already in use (attempt {attempt}/{})", self.attempts);
                }
                Err(e) => return Err(e.into()),
            }
        }
        error!(
            "giving up on unique mac for instance {instance_uuid} after {} attempts",
            self.attempts
        );
        self.store
            .virtual_interface_delete_by_instance(instance_uuid)
            .await?;
        Err(NetworkError::VirtualInterfaceMacAddressExhausted(self.attempts))
    }
}
