use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// Version of the host-to-host network API spoken by this build.
pub const RPC_API_VERSION: &str = "1.7";

/// Upper bound of one encoded request or response.
pub const MAX_FRAME: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub version: String,
    pub request: NetworkRequest,
}

impl Envelope {
    pub fn new(request: NetworkRequest) -> Self {
        Envelope {
            version: RPC_API_VERSION.to_string(),
            request,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NetworkRequest {
    AllocateFixedIp {
        instance_uuid: String,
        network_id: i64,
        address: Option<Ipv4Addr>,
        vpn: bool,
    },
    DeallocateFixedIp {
        address: Ipv4Addr,
        host: Option<String>,
    },
    SetupNetworkOnHost {
        network_id: i64,
        teardown: bool,
    },
    UpdateDns {
        network_ids: Vec<i64>,
    },
    /// DHCP server callbacks.
    LeaseFixedIp {
        address: Ipv4Addr,
    },
    ReleaseFixedIp {
        address: Ipv4Addr,
    },
    Ping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NetworkResponse {
    Ack,
    Address(Option<Ipv4Addr>),
    Pong,
    Error(String),
}

fn parse_version(v: &str) -> Option<(u32, u32)> {
    let (major, minor) = v.split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// A server accepts calls of the same major version and a minor version no
/// newer than its own.
pub fn is_compatible(requested: &str, supported: &str) -> bool {
    match (parse_version(requested), parse_version(supported)) {
        (Some((rmaj, rmin)), Some((smaj, smin))) => rmaj == smaj && rmin <= smin,
        _ => false,
    }
}
