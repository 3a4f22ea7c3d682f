//! dnstun - IP over DNS
//!
//! Runs either end of the tunnel. Tunnel packets enter and leave through a
//! local UDP "bridge" socket, one IP packet per datagram, so any TUN helper
//! (or a test harness) can sit on the other side.

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use dnstun::transport::{self, PacketChannels};
use dnstun::{format_addr, get_addr, AddrFamily, AddrFlags, ClientEngine, ServerEngine, TunnelConfig};

/// Packets buffered between the bridge and the tunnel in each direction
const CHANNEL_DEPTH: usize = 256;

#[derive(Parser)]
#[command(name = "dnstun")]
#[command(version)]
#[command(about = "Tunnel IP packets through DNS", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Domain delegated to the tunnel server
    #[arg(short, long)]
    topdomain: Option<String>,

    /// Shared login password
    #[arg(short, long, env = "DNSTUN_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer tunnel queries as the authoritative server for the topdomain
    Server {
        /// Address to listen on (all interfaces when omitted)
        #[arg(short, long)]
        listen: Option<String>,

        /// DNS port
        #[arg(long, default_value_t = 53)]
        port: u16,

        /// Local UDP address exchanging tunnel packets
        #[arg(short, long, default_value = "127.0.0.1:5300")]
        bridge: SocketAddr,
    },

    /// Connect to the server through a resolver
    Client {
        /// Recursive resolver (or the server itself)
        #[arg(short, long)]
        resolver: String,

        /// Resolver port
        #[arg(long, default_value_t = 53)]
        port: u16,

        /// Local UDP address exchanging tunnel packets
        #[arg(short, long, default_value = "127.0.0.1:5301")]
        bridge: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    let config = load_config(&cli)?;

    match cli.command {
        Commands::Server { listen, port, bridge } => run_server(config, listen.as_deref(), port, bridge).await,
        Commands::Client { resolver, port, bridge } => run_client(config, &resolver, port, bridge).await,
    }
}

fn load_config(cli: &Cli) -> Result<TunnelConfig> {
    let mut config = match &cli.config {
        Some(path) => TunnelConfig::load(path)?,
        None => {
            let Some(topdomain) = &cli.topdomain else {
                bail!("either --config or --topdomain is required");
            };
            TunnelConfig::new(topdomain, "")
        }
    };
    if let Some(topdomain) = &cli.topdomain {
        config.topdomain = topdomain.clone();
    }
    if let Some(password) = &cli.password {
        config.password = password.clone();
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

async fn run_server(config: TunnelConfig, listen: Option<&str>, port: u16, bridge: SocketAddr) -> Result<()> {
    let (addr, len) = get_addr(listen, port, AddrFamily::Unspec, AddrFlags::PASSIVE)?;
    info!("Starting dnstun server for {} on {}:{}", config.topdomain, format_addr(&addr, len), port);

    let engine = ServerEngine::new(config)?;
    let socket = UdpSocket::bind(addr)
        .await
        .with_context(|| format!("binding DNS socket {}", addr))?;
    let channels = spawn_bridge(bridge).await?;

    transport::run_server(engine, socket, channels).await?;
    Ok(())
}

async fn run_client(config: TunnelConfig, resolver: &str, port: u16, bridge: SocketAddr) -> Result<()> {
    let (addr, len) = get_addr(Some(resolver), port, AddrFamily::Unspec, AddrFlags::NONE)?;
    info!("Starting dnstun client for {} via {}:{}", config.topdomain, format_addr(&addr, len), port);

    let local = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(local).await.context("binding DNS socket")?;
    socket
        .connect(addr)
        .await
        .with_context(|| format!("connecting to resolver {}", addr))?;

    let engine = ClientEngine::new(config, Instant::now())?;
    let channels = spawn_bridge(bridge).await?;

    transport::run_client(engine, socket, channels).await?;
    Ok(())
}

/// Bind the bridge socket and shuttle datagrams between it and the tunnel.
/// Packets out of the tunnel go to whoever last sent a packet in.
async fn spawn_bridge(bridge: SocketAddr) -> Result<PacketChannels> {
    let socket = UdpSocket::bind(bridge)
        .await
        .with_context(|| format!("binding bridge socket {}", bridge))?;
    info!("Packet bridge on {}", bridge);

    let (outbound_tx, outbound_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_DEPTH);
    let (inbound_tx, mut inbound_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_DEPTH);

    tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        let mut peer: Option<SocketAddr> = None;
        loop {
            tokio::select! {
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => {
                        if peer != Some(from) {
                            debug!("Bridge peer is now {}", from);
                            peer = Some(from);
                        }
                        if outbound_tx.send(buf[..len].to_vec()).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Bridge recv error: {}", e),
                },
                packet = inbound_rx.recv() => {
                    let Some(packet) = packet else { break };
                    match peer {
                        Some(to) => {
                            if let Err(e) = socket.send_to(&packet, to).await {
                                warn!("Bridge send to {} failed: {}", to, e);
                            }
                        }
                        None => debug!("No bridge peer yet, dropping {}-byte packet", packet.len()),
                    }
                }
            }
        }
        debug!("Bridge stopped");
    });

    Ok(PacketChannels {
        outbound: outbound_rx,
        inbound: inbound_tx,
    })
}
