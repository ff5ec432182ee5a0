use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;
mod config;

#[derive(Parser)]
#[command(name = "exu")]
#[command(about = "A user-space virtual Ethernet fabric")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the fabric server, accepting tunnel clients and switching their traffic
    Server {
        /// Path to a TOML config file
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// UDP port the tunnel handshake listens on
        #[arg(long)]
        port: Option<u16>,

        /// Base address of the /24 subnet handed out to tunnel clients
        #[arg(long)]
        subnet: Option<Ipv4Addr>,

        /// Maximum number of concurrent tunnel clients
        #[arg(long)]
        max_clients: Option<u16>,
    },

    /// Bridge a host TAP interface into a remote fabric over the tunnel
    Connect {
        /// Path to a TOML config file
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Fabric server address, e.g. 10.1.2.3:6885
        #[arg(long)]
        server: Option<String>,

        /// Name of the TAP interface to create, e.g. tap0
        #[arg(long)]
        tap_name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server {
            config,
            port,
            subnet,
            max_clients,
        } => commands::server::run(config, port, subnet, max_clients).await?,
        Commands::Connect {
            config,
            server,
            tap_name,
        } => commands::connect::run(config, server, tap_name).await?,
    }

    Ok(())
}
