use std::net::Ipv4Addr;

use libipam::IpamError;

use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("network could not be created because {0} is required")]
    NetworkNotCreated(&'static str),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("network {0} already exists")]
    NetworkAlreadyExists(String),
    #[error("network must be disassociated from project {project} before delete")]
    NetworkNotDisassociated { project: String },
    #[error("ip {0} is not associated with any instance")]
    FixedIpNotAssociated(Ipv4Addr),
    #[error("fixed ip {address} does not belong to network {network_uuid}")]
    FixedIpNotFoundForNetwork {
        address: Ipv4Addr,
        network_uuid: String,
    },
    #[error("instance {instance_uuid} has no fixed ip {address}")]
    FixedIpNotFoundForInstance {
        instance_uuid: String,
        address: Ipv4Addr,
    },
    #[error("virtual interface for instance {instance_uuid} on network {network_id} not found")]
    VirtualInterfaceNotFound {
        instance_uuid: String,
        network_id: i64,
    },
    #[error("unable to create a virtual interface with a unique mac after {0} attempts")]
    VirtualInterfaceMacAddressExhausted(u32),
    #[error("operation {0} is not supported by the {1} topology")]
    NotSupported(&'static str, &'static str),
    #[error("host {host} failed: {message}")]
    Remote { host: String, message: String },
    #[error("rpc to {host} failed: {source}")]
    Rpc {
        host: String,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Ipam(#[from] IpamError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Driver(#[from] anyhow::Error),
}
