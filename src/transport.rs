//! tokio UDP drivers for the protocol engines
//!
//! Each driver owns its engine inside a single task and moves bytes between
//! three places: the DNS socket, and a pair of channels that carry whole IP
//! packets to and from whatever stands in for the network interface.

use crate::client::ClientEngine;
use crate::server::ServerEngine;
use crate::session::SessionState;
use crate::Result;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// Largest datagram either side will read
const MAX_DATAGRAM: usize = 65535;

/// Timer tick when an engine has nothing scheduled
const IDLE_TICK: Duration = Duration::from_secs(1);

/// Packet channels between a driver and the local network side
pub struct PacketChannels {
    /// Packets to send through the tunnel
    pub outbound: mpsc::Receiver<Vec<u8>>,
    /// Packets that came out of the tunnel
    pub inbound: mpsc::Sender<Vec<u8>>,
}

fn deadline(next: Option<Instant>) -> tokio::time::Instant {
    let at = next.unwrap_or_else(|| Instant::now() + IDLE_TICK);
    tokio::time::Instant::from_std(at)
}

fn forward(inbound: &mpsc::Sender<Vec<u8>>, packet: Vec<u8>) {
    if let Err(e) = inbound.try_send(packet) {
        log::warn!("Inbound packet dropped: {}", e);
    }
}

/// Serve DNS queries on `socket` until the outbound channel closes
pub async fn run_server(mut engine: ServerEngine, socket: UdpSocket, mut channels: PacketChannels) -> Result<()> {
    log::info!(
        "DNS tunnel server listening on {} for {}",
        socket.local_addr()?,
        engine.framer().topdomain()
    );
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (len, peer) = match received {
                    Ok(received) => received,
                    Err(e) => {
                        log::error!("UDP recv_from error: {}", e);
                        continue;
                    }
                };
                if let Some(reply) = engine.handle_query(&buf[..len], Instant::now()) {
                    if let Err(e) = socket.send_to(&reply, peer).await {
                        log::error!("Failed to answer {}: {}", peer, e);
                    }
                }
                while let Some((id, packet)) = engine.take_inbound() {
                    log::trace!("Session {:02x}: forwarding {} bytes", id, packet.len());
                    forward(&channels.inbound, packet);
                }
            }
            packet = channels.outbound.recv() => {
                let Some(packet) = packet else {
                    log::info!("Packet source closed, stopping server");
                    return Ok(());
                };
                if let Err(e) = engine.route_outbound(&packet) {
                    log::debug!("Outbound packet dropped: {}", e);
                }
            }
            _ = tokio::time::sleep_until(deadline(engine.next_timeout())) => {
                engine.handle_timeout(Instant::now());
            }
        }
    }
}

/// Run a client session over `socket`, which must be connected to the
/// resolver. Returns once the session has closed; closing the outbound
/// channel starts an orderly shutdown.
pub async fn run_client(mut engine: ClientEngine, socket: UdpSocket, mut channels: PacketChannels) -> Result<()> {
    log::info!("DNS tunnel client using resolver {}", socket.peer_addr()?);
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut source_open = true;

    loop {
        while let Some(query) = engine.poll_query(Instant::now())? {
            if let Err(e) = socket.send(&query).await {
                log::warn!("UDP send error: {}", e);
            }
        }
        if engine.state() == SessionState::Closed {
            log::info!("Session closed");
            return Ok(());
        }

        tokio::select! {
            received = socket.recv(&mut buf) => {
                let len = match received {
                    Ok(len) => len,
                    Err(e) => {
                        log::warn!("UDP recv error: {}", e);
                        continue;
                    }
                };
                engine.handle_response(&buf[..len], Instant::now())?;
                while let Some(packet) = engine.take_inbound() {
                    forward(&channels.inbound, packet);
                }
            }
            packet = channels.outbound.recv(), if source_open => {
                match packet {
                    Some(packet) => {
                        if let Err(e) = engine.submit_outbound(&packet) {
                            log::warn!("Outbound packet dropped: {}", e);
                        }
                    }
                    None => {
                        source_open = false;
                        engine.close();
                    }
                }
            }
            _ = tokio::time::sleep_until(deadline(engine.next_timeout())) => {
                engine.handle_timeout(Instant::now())?;
            }
        }
    }
}
