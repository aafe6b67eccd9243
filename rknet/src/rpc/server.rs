use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use quinn::{Connection, Endpoint, RecvStream, SendStream, ServerConfig};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use tokio_util::sync::CancellationToken;

use super::install_crypto_provider;
use super::protocol::{Envelope, MAX_FRAME, NetworkRequest, NetworkResponse, RPC_API_VERSION, is_compatible};

/// Local side of the host-to-host API.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, request: NetworkRequest) -> NetworkResponse;
}

/// generates a self-signed TLS certificate and constructs QUIC server config.
fn configure_server() -> Result<ServerConfig> {
    install_crypto_provider();
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])?;
    let cert_der = CertificateDer::from(cert.serialize_der()?);
    let key = PrivatePkcs8KeyDer::from(cert.serialize_private_key_der());
    let server_config =
        ServerConfig::with_single_cert(vec![cert_der], rustls::pki_types::PrivateKeyDer::Pkcs8(key))?;
    Ok(server_config)
}

pub fn make_server_endpoint(bind_addr: SocketAddr) -> Result<Endpoint> {
    let endpoint = Endpoint::server(configure_server()?, bind_addr)?;
    Ok(endpoint)
}

/// Accepts connections until `shutdown` fires, one task per connection.
pub async fn serve(
    endpoint: Endpoint,
    handler: Arc<dyn RpcHandler>,
    shutdown: CancellationToken,
) -> Result<()> {
    info!("network rpc listening on {}", endpoint.local_addr()?);
    loop {
        let incoming = tokio::select! {
            _ = shutdown.cancelled() => break,
            incoming = endpoint.accept() => incoming,
        };
        let Some(incoming) = incoming else {
            break;
        };
        let handler = handler.clone();
        tokio::spawn(async move {
            match incoming.await {
                Ok(conn) => {
                    debug!("connection accepted: addr={}", conn.remote_address());
                    handle_connection(conn, handler).await;
                }
                Err(e) => warn!("failed to establish connection: {e}"),
            }
        });
    }
    endpoint.close(0u32.into(), b"shutdown");
    info!("network rpc server stopped");
    Ok(())
}

async fn handle_connection(conn: Connection, handler: Arc<dyn RpcHandler>) {
    loop {
        match conn.accept_bi().await {
            Ok((send, recv)) => {
                let handler = handler.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_stream(send, recv, handler).await {
                        error!("stream error: {e:?}");
                    }
                });
            }
            Err(e) => {
                debug!("connection {} closed: {e}", conn.remote_address());
                break;
            }
        }
    }
}

async fn handle_stream(
    mut send: SendStream,
    mut recv: RecvStream,
    handler: Arc<dyn RpcHandler>,
) -> Result<()> {
    let buf = recv.read_to_end(MAX_FRAME).await?;
    let response = match bincode::deserialize::<Envelope>(&buf) {
        Ok(env) if is_compatible(&env.version, RPC_API_VERSION) => handler.handle(env.request).await,
        Ok(env) => NetworkResponse::Error(format!(
            "unsupported rpc version {} (server speaks {RPC_API_VERSION})",
            env.version
        )),
        Err(e) => NetworkResponse::Error(format!("malformed request: {e}")),
    };
    send.write_all(&bincode::serialize(&response)?).await?;
    send.finish()?;
    Ok(())
}
