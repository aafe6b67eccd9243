use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use log::{debug, warn};
use quinn::crypto::rustls::QuicClientConfig;
use quinn::{ClientConfig as QuinnClientConfig, Connection, Endpoint};
use rustls::DigitallySignedStruct;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig as RustlsClientConfig, RootCertStore, SignatureScheme};
use tokio::sync::Mutex;

use super::protocol::{Envelope, MAX_FRAME, NetworkRequest, NetworkResponse};
use super::{NetworkRpc, install_crypto_provider};
use crate::{NetworkError, Result};

const CALL_TIMEOUT: Duration = Duration::from_secs(30);
const PING_TIMEOUT: Duration = Duration::from_secs(3);

/// Peers present self-signed certificates.
#[derive(Debug)]
struct SkipServerVerification;

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}

/// QUIC client to the network service of peer hosts. Connections are cached
/// per address and re-established once closed.
pub struct QuicRpcClient {
    endpoint: Endpoint,
    peers: HashMap<String, SocketAddr>,
    connections: Mutex<HashMap<SocketAddr, Connection>>,
}

impl QuicRpcClient {
    pub fn new(peers: HashMap<String, SocketAddr>) -> anyhow::Result<Self> {
        install_crypto_provider();
        let mut tls = RustlsClientConfig::builder()
            .with_root_certificates(RootCertStore::empty())
            .with_no_client_auth();
        tls.dangerous()
            .set_certificate_verifier(Arc::new(SkipServerVerification));

        let quic_crypto = QuicClientConfig::try_from(tls)?;
        let client_cfg = QuinnClientConfig::new(Arc::new(quic_crypto));
        let bind: SocketAddr = "0.0.0.0:0".parse()?;
        let mut endpoint = Endpoint::client(bind)?;
        endpoint.set_default_client_config(client_cfg);

        Ok(Self {
            endpoint,
            peers,
            connections: Mutex::new(HashMap::new()),
        })
    }

    pub fn hosts(&self) -> impl Iterator<Item = &String> {
        self.peers.keys()
    }

    fn peer(&self, host: &str) -> anyhow::Result<SocketAddr> {
        self.peers
            .get(host)
            .copied()
            .ok_or_else(|| anyhow!("no address known for host {host}"))
    }

    /// The cache lock is not held during the handshake, so a silent peer
    /// only stalls calls to itself.
    async fn connection(&self, addr: SocketAddr) -> anyhow::Result<Connection> {
        if let Some(conn) = self.connections.lock().await.get(&addr)
            && conn.close_reason().is_none()
        {
            return Ok(conn.clone());
        }
        let conn = self
            .endpoint
            .connect(addr, "localhost")?
            .await
            .with_context(|| format!("failed to connect to {addr}"))?;
        debug!("connected to network service at {addr}");

        let mut conns = self.connections.lock().await;
        // Another call may have connected meanwhile; keep whichever is open.
        if let Some(existing) = conns.get(&addr)
            && existing.close_reason().is_none()
        {
            return Ok(existing.clone());
        }
        conns.insert(addr, conn.clone());
        Ok(conn)
    }

    /// Sends one request on a fresh bidirectional stream.
    pub async fn call_addr(
        &self,
        addr: SocketAddr,
        request: NetworkRequest,
        timeout: Duration,
    ) -> anyhow::Result<NetworkResponse> {
        let exchange = async {
            let conn = self.connection(addr).await?;
            let (mut send, mut recv) = conn.open_bi().await?;
            let data = bincode::serialize(&Envelope::new(request))?;
            send.write_all(&data).await?;
            send.finish()?;
            let buf = recv.read_to_end(MAX_FRAME).await?;
            Ok::<_, anyhow::Error>(bincode::deserialize::<NetworkResponse>(&buf)?)
        };
        tokio::time::timeout(timeout, exchange)
            .await
            .with_context(|| format!("call to {addr} timed out"))?
    }

    async fn call(&self, host: &str, request: NetworkRequest) -> Result<NetworkResponse> {
        let response = async {
            let addr = self.peer(host)?;
            self.call_addr(addr, request, CALL_TIMEOUT).await
        }
        .await
        .map_err(|source| NetworkError::Rpc {
            host: host.to_string(),
            source,
        })?;
        match response {
            NetworkResponse::Error(message) => Err(NetworkError::Remote {
                host: host.to_string(),
                message,
            }),
            other => Ok(other),
        }
    }
}

fn unexpected(host: &str, response: NetworkResponse) -> NetworkError {
    NetworkError::Rpc {
        host: host.to_string(),
        source: anyhow!("unexpected response {response:?}"),
    }
}

#[async_trait]
impl NetworkRpc for QuicRpcClient {
    async fn allocate_fixed_ip(
        &self,
        host: &str,
        instance_uuid: &str,
        network_id: i64,
        address: Option<Ipv4Addr>,
        vpn: bool,
    ) -> Result<Option<Ipv4Addr>> {
        let request = NetworkRequest::AllocateFixedIp {
            instance_uuid: instance_uuid.to_string(),
            network_id,
            address,
            vpn,
        };
        match self.call(host, request).await? {
            NetworkResponse::Address(address) => Ok(address),
            other => Err(unexpected(host, other)),
        }
    }

    async fn deallocate_fixed_ip(
        &self,
        host: &str,
        address: Ipv4Addr,
        instance_host: Option<&str>,
    ) -> Result<()> {
        let request = NetworkRequest::DeallocateFixedIp {
            address,
            host: instance_host.map(str::to_string),
        };
        match self.call(host, request).await? {
            NetworkResponse::Ack => Ok(()),
            other => Err(unexpected(host, other)),
        }
    }

    async fn setup_network_on_host(&self, host: &str, network_id: i64, teardown: bool) -> Result<()> {
        let request = NetworkRequest::SetupNetworkOnHost {
            network_id,
            teardown,
        };
        match self.call(host, request).await? {
            NetworkResponse::Ack => Ok(()),
            other => Err(unexpected(host, other)),
        }
    }

    async fn update_dns(&self, network_ids: &[i64]) {
        let casts = self.peers.keys().map(|host| async move {
            let request = NetworkRequest::UpdateDns {
                network_ids: network_ids.to_vec(),
            };
            if let Err(e) = self.call(host, request).await {
                warn!("update_dns cast to {host} failed: {e}");
            }
        });
        futures::future::join_all(casts).await;
    }

    async fn service_is_up(&self, host: &str) -> bool {
        let Ok(addr) = self.peer(host) else {
            return false;
        };
        matches!(
            self.call_addr(addr, NetworkRequest::Ping, PING_TIMEOUT).await,
            Ok(NetworkResponse::Pong)
        )
    }
}
