use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};

#[derive(Parser)]
#[command(name = "rknet", version, about = "RK8s fixed IP and tenant network service")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the network service with config file
    Start {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Manage tenant networks
    Network {
        #[arg(short, long)]
        config: PathBuf,
        #[command(subcommand)]
        command: NetworkCommands,
    },
    /// Report a DHCP lease to the local service
    Lease {
        #[arg(short, long)]
        config: PathBuf,
        address: Ipv4Addr,
    },
    /// Report a DHCP release to the local service
    Release {
        #[arg(short, long)]
        config: PathBuf,
        address: Ipv4Addr,
    },
}

#[derive(Subcommand)]
pub enum NetworkCommands {
    /// Carve and create one or more networks
    Create(CreateArgs),
    /// Delete a network by uuid or cidr
    Delete {
        #[arg(long, conflicts_with = "cidr", required_unless_present = "cidr")]
        uuid: Option<String>,
        #[arg(long)]
        cidr: Option<IpNetwork>,
        /// Delete even if still associated with a project
        #[arg(long)]
        force: bool,
    },
    /// List all networks
    List,
}

#[derive(Args)]
pub struct CreateArgs {
    #[arg(long)]
    pub label: String,
    #[arg(long)]
    pub cidr: Option<Ipv4Network>,
    #[arg(long)]
    pub cidr_v6: Option<Ipv6Network>,
    #[arg(long)]
    pub num_networks: Option<u32>,
    #[arg(long)]
    pub network_size: Option<u32>,
    #[arg(long)]
    pub multi_host: Option<bool>,
    #[arg(long)]
    pub gateway: Option<Ipv4Addr>,
    #[arg(long)]
    pub bridge: Option<String>,
    #[arg(long)]
    pub bridge_interface: Option<String>,
    #[arg(long)]
    pub dns1: Option<IpAddr>,
    #[arg(long)]
    pub dns2: Option<IpAddr>,
    #[arg(long)]
    pub fixed_cidr: Option<Ipv4Network>,
    #[arg(long)]
    pub vlan_start: Option<u16>,
    #[arg(long)]
    pub vpn_start: Option<u16>,
    #[arg(long)]
    pub project_id: Option<String>,
}
