use ipnetwork::IpNetwork;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IpamError {
    #[error("cidr already in use: {0}")]
    CidrInUse(IpNetwork),

    #[error("requested cidr ({cidr}) conflicts with existing supernet ({supernet})")]
    ConflictsWithSupernet { cidr: IpNetwork, supernet: IpNetwork },

    #[error("requested cidr ({cidr}) conflicts with existing smaller cidr ({smaller})")]
    ConflictsWithSmaller { cidr: IpNetwork, smaller: IpNetwork },

    #[error("network {cidr} cannot hold {requested} subnets of prefix /{prefix}")]
    InsufficientSpace {
        cidr: IpNetwork,
        prefix: u8,
        requested: u32,
    },

    #[error("invalid network size {0}")]
    InvalidNetworkSize(u32),

    #[error("network {0} too small to allocate from")]
    NetworkTooSmall(IpNetwork),

    #[error("network has host bits set: {0}")]
    HostBitsSet(IpNetwork),

    #[error("invalid mac address {0}")]
    InvalidMac(String),

    #[error(transparent)]
    IpNetwork(#[from] ipnetwork::IpNetworkError),
}
