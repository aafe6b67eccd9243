//! Host-to-host calls of the network service over QUIC.

use std::net::Ipv4Addr;

use async_trait::async_trait;

use crate::Result;

pub mod client;
pub mod protocol;
pub mod server;

pub use client::QuicRpcClient;
pub use protocol::{NetworkRequest, NetworkResponse, RPC_API_VERSION};
pub use server::{RpcHandler, make_server_endpoint, serve};

/// Calls into the network service of another host.
#[async_trait]
pub trait NetworkRpc: Send + Sync {
    async fn allocate_fixed_ip(
        &self,
        host: &str,
        instance_uuid: &str,
        network_id: i64,
        address: Option<Ipv4Addr>,
        vpn: bool,
    ) -> Result<Option<Ipv4Addr>>;

    async fn deallocate_fixed_ip(
        &self,
        host: &str,
        address: Ipv4Addr,
        instance_host: Option<&str>,
    ) -> Result<()>;

    async fn setup_network_on_host(&self, host: &str, network_id: i64, teardown: bool) -> Result<()>;

    /// Cast to every known host. Failures are logged, never returned.
    async fn update_dns(&self, network_ids: &[i64]);

    async fn service_is_up(&self, host: &str) -> bool;
}

pub(crate) fn install_crypto_provider() {
    let _ = rustls::crypto::CryptoProvider::install_default(
        rustls::crypto::ring::default_provider(),
    );
}
