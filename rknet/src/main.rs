mod cli;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use cli::{Cli, Commands, CreateArgs, NetworkCommands};
use log::{error, info};
use rknet::NetworkManager;
use rknet::config::{Config, load_config};
use rknet::context::{Drivers, NetworkContext};
use rknet::create::CreateNetworkRequest;
use rknet::rpc::{NetworkRequest, NetworkResponse, QuicRpcClient, make_server_endpoint, serve};
use rknet::store::Store;
use rknet::store::memory::MemoryStore;
use rknet::store::xline::XlineStore;
use rknet::tasks::{join_periodic_tasks, spawn_periodic_tasks};
use tokio::signal;
use tokio_util::sync::CancellationToken;

const LOCAL_CALL_TIMEOUT: Duration = Duration::from_secs(10);

fn read_config(path: &Path) -> anyhow::Result<Config> {
    let path = path
        .to_str()
        .with_context(|| format!("config path {} is not valid UTF-8", path.display()))?;
    load_config(path)
}

async fn build_manager(cfg: &Config) -> anyhow::Result<Arc<NetworkManager>> {
    let store: Arc<dyn Store> = match &cfg.xline_config {
        Some(xline) => Arc::new(XlineStore::new(xline.clone()).await?),
        None => {
            info!("no xline_config given, using the in-memory store");
            Arc::new(MemoryStore::new())
        }
    };
    let ctx = NetworkContext::new(
        cfg.host.clone(),
        cfg.network.clone(),
        store,
        Drivers::default(),
    );
    let rpc = Arc::new(QuicRpcClient::new(cfg.peer_addrs()?)?);
    Ok(Arc::new(NetworkManager::new(cfg.topology, ctx, rpc)))
}

async fn start(cfg: Config) -> anyhow::Result<()> {
    let addr: SocketAddr = cfg
        .addr
        .parse()
        .with_context(|| format!("invalid listen address {}", cfg.addr))?;
    let manager = build_manager(&cfg).await?;
    manager.init_host().await.context("init_host failed")?;

    let token = CancellationToken::new();
    let tasks = spawn_periodic_tasks(manager.clone(), token.clone());
    let endpoint = make_server_endpoint(addr)?;
    info!("[rknet] {} host {} listening on {addr}", cfg.topology, cfg.host);

    let server = tokio::spawn(serve(endpoint, manager, token.clone()));
    tokio::select! {
        res = signal::ctrl_c() => {
            res.context("failed to listen for ctrl-c")?;
            info!("Received Ctrl+C, shutting down...");
        }
        _ = token.cancelled() => {}
    }
    token.cancel();

    match server.await {
        Ok(Err(e)) => error!("rpc server exited with error: {e:?}"),
        Err(e) => error!("rpc server task failed: {e}"),
        Ok(Ok(())) => {}
    }
    let failed = join_periodic_tasks(tasks).await;
    if failed > 0 {
        error!("{failed} periodic task(s) did not stop cleanly");
    }
    info!("Exiting cleanly...");
    Ok(())
}

fn create_request(args: CreateArgs) -> CreateNetworkRequest {
    CreateNetworkRequest {
        label: args.label,
        cidr: args.cidr,
        cidr_v6: args.cidr_v6,
        multi_host: args.multi_host,
        num_networks: args.num_networks,
        network_size: args.network_size,
        gateway: args.gateway,
        bridge: args.bridge,
        bridge_interface: args.bridge_interface,
        dns1: args.dns1,
        dns2: args.dns2,
        fixed_cidr: args.fixed_cidr,
        vlan_start: args.vlan_start,
        vpn_start: args.vpn_start,
        project_id: args.project_id,
        ..Default::default()
    }
}

async fn network(cfg: Config, command: NetworkCommands) -> anyhow::Result<()> {
    let manager = build_manager(&cfg).await?;
    match command {
        NetworkCommands::Create(args) => {
            for network in manager.create_networks(create_request(args)).await? {
                println!("{}\t{}\t{}", network.uuid, network.label, display(network.cidr));
            }
        }
        NetworkCommands::Delete { uuid, cidr, force } => {
            manager.delete_network(uuid.as_deref(), cidr, !force).await?;
        }
        NetworkCommands::List => {
            for network in manager.get_all_networks().await? {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    network.uuid,
                    network.label,
                    display(network.cidr),
                    display(network.vlan),
                    network.project_id.as_deref().unwrap_or("-"),
                );
            }
        }
    }
    Ok(())
}

fn display<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

async fn call_local(cfg: Config, request: NetworkRequest) -> anyhow::Result<()> {
    let addr: SocketAddr = cfg.addr.parse()?;
    let client = QuicRpcClient::new(Default::default())?;
    match client.call_addr(addr, request, LOCAL_CALL_TIMEOUT).await? {
        NetworkResponse::Error(message) => bail!("{message}"),
        _ => Ok(()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .target(env_logger::Target::Stdout)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Start { config } => start(read_config(&config)?).await,
        Commands::Network { config, command } => network(read_config(&config)?, command).await,
        Commands::Lease { config, address } => {
            call_local(read_config(&config)?, NetworkRequest::LeaseFixedIp { address }).await
        }
        Commands::Release { config, address } => {
            call_local(read_config(&config)?, NetworkRequest::ReleaseFixedIp { address }).await
        }
    }
}
