//! Packets through the tunnel, in memory and over real UDP sockets

mod harness;

use dnstun::frame::FrameKind;
use dnstun::transport::{self, PacketChannels};
use dnstun::{ClientEngine, ServerEngine, SessionState};
use harness::{config, ipv4_packet, Harness};
use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

const CLIENT_ADDR: [u8; 4] = [10, 0, 0, 2];
const SERVER_ADDR: [u8; 4] = [10, 0, 0, 1];

#[test]
fn test_large_upstream_packet() {
    let mut h = Harness::new(config(), config());
    h.establish();
    let id = h.session();

    let packet = ipv4_packet(CLIENT_ADDR, SERVER_ADDR, 4000);
    assert!(h.client.submit_outbound(&packet).unwrap());

    let mut received = None;
    h.run_until(500, |h| {
        received = h.server.take_inbound();
        received.is_some()
    })
    .unwrap();

    assert_eq!(received, Some((id, packet)));
    assert!(h.server.take_inbound().is_none());

    let data = h.sent.iter().filter(|k| **k == FrameKind::Data).count();
    // 185 bytes per base128 query under t.example.com
    assert_eq!(data, 22);
}

#[test]
fn test_upstream_fragment_size_cap() {
    let mut client = config();
    client.max_upstream_fragment_size = Some(100);
    let mut h = Harness::new(client, config());
    h.establish();
    let id = h.session();
    assert_eq!(h.client.negotiated().unwrap().upstream_fragment_size, 100);
    assert_eq!(h.server.negotiated(id).unwrap().upstream_fragment_size, 100);

    let packet = ipv4_packet(CLIENT_ADDR, SERVER_ADDR, 4000);
    assert!(h.client.submit_outbound(&packet).unwrap());

    let mut received = None;
    h.run_until(500, |h| {
        received = h.server.take_inbound();
        received.is_some()
    })
    .unwrap();

    assert_eq!(received, Some((id, packet)));
    let data = h.sent.iter().filter(|k| **k == FrameKind::Data).count();
    assert_eq!(data, 40);
}

#[test]
fn test_downstream_needs_several_polls() {
    let mut client = config();
    client.max_fragment_size = Some(200);
    let mut server = config();
    server.limits.downstream_window = 1;

    let mut h = Harness::new(client, server);
    h.establish();
    let id = h.session();
    assert_eq!(h.client.negotiated().unwrap().downstream_fragment_size, 200);

    let packet = ipv4_packet(SERVER_ADDR, CLIENT_ADDR, 300);
    assert!(h.server.submit_outbound(id, &packet).unwrap());
    let before = h.sent.len();

    let mut received = None;
    h.run_until(500, |h| {
        received = h.client.take_inbound();
        received.is_some()
    })
    .unwrap();

    assert_eq!(received, Some(packet));
    let polls = h.sent[before..].iter().filter(|k| **k == FrameKind::Poll).count();
    assert!(polls >= 2, "{} polls", polls);
}

#[test]
fn test_reply_routed_by_tunnel_address() {
    let mut h = Harness::new(config(), config());
    h.establish();
    let id = h.session();

    let ping = ipv4_packet(CLIENT_ADDR, SERVER_ADDR, 84);
    h.client.submit_outbound(&ping).unwrap();
    h.run_until(100, |h| h.server.take_inbound().is_some()).unwrap();

    let pong = ipv4_packet(SERVER_ADDR, CLIENT_ADDR, 84);
    assert_eq!(h.server.route_outbound(&pong).unwrap(), Some(id));
    let stranger = ipv4_packet(SERVER_ADDR, [10, 0, 0, 9], 84);
    assert_eq!(h.server.route_outbound(&stranger).unwrap(), None);

    let mut received = None;
    h.run_until(500, |h| {
        received = h.client.take_inbound();
        received.is_some()
    })
    .unwrap();
    assert_eq!(received, Some(pong));
}

#[test]
fn test_lost_fragment_retransmitted_once_delivered() {
    let mut dropped = false;
    let mut h = Harness::new(config(), config()).with_filter(move |f| {
        if !dropped && f.header.kind == FrameKind::Data && f.header.index == 1 {
            dropped = true;
            return false;
        }
        true
    });
    h.establish();
    let id = h.session();

    let packet = ipv4_packet(CLIENT_ADDR, SERVER_ADDR, 1000);
    h.client.submit_outbound(&packet).unwrap();

    let mut received = None;
    h.run_until(500, |h| {
        received = h.server.take_inbound();
        received.is_some()
    })
    .unwrap();
    assert_eq!(received, Some((id, packet)));

    // retransmitted duplicates must not produce a second copy
    let until = h.now + Duration::from_secs(5);
    h.run_until(500, |h| h.now >= until).unwrap();
    assert!(h.server.take_inbound().is_none());
}

#[test]
fn test_lost_downstream_fragment_retransmitted() {
    let lost = Rc::new(Cell::new(0));
    let counter = Rc::clone(&lost);
    let mut h = Harness::new(config(), config()).with_answer_filter(move |_, answer| {
        if answer.header.kind == FrameKind::Data && answer.header.index == 1 && counter.get() < 2 {
            counter.set(counter.get() + 1);
            return false;
        }
        true
    });
    h.establish();
    let id = h.session();

    let packet = ipv4_packet(SERVER_ADDR, CLIENT_ADDR, 3000);
    assert!(h.server.submit_outbound(id, &packet).unwrap());

    let mut received = None;
    h.run_until(1000, |h| {
        received = h.client.take_inbound();
        received.is_some()
    })
    .unwrap();
    assert_eq!(received, Some(packet));
    assert_eq!(lost.get(), 2);

    let until = h.now + Duration::from_secs(5);
    h.run_until(1000, |h| h.now >= until).unwrap();
    assert!(h.client.take_inbound().is_none());
    assert_eq!(h.client.state(), SessionState::Established);
}

#[tokio::test]
async fn test_udp_drivers() {
    let server_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server_socket.local_addr().unwrap();
    let (server_out_tx, server_out_rx) = mpsc::channel(16);
    let (server_in_tx, mut server_in_rx) = mpsc::channel(16);
    let server = tokio::spawn(transport::run_server(
        ServerEngine::new(config()).unwrap(),
        server_socket,
        PacketChannels {
            outbound: server_out_rx,
            inbound: server_in_tx,
        },
    ));

    let client_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client_socket.connect(server_addr).await.unwrap();
    let engine = ClientEngine::new(config(), Instant::now()).unwrap();
    assert_eq!(engine.state(), SessionState::Handshaking);
    let (client_out_tx, client_out_rx) = mpsc::channel(16);
    let (client_in_tx, _client_in_rx) = mpsc::channel(16);
    let client = tokio::spawn(transport::run_client(
        engine,
        client_socket,
        PacketChannels {
            outbound: client_out_rx,
            inbound: client_in_tx,
        },
    ));

    // packets offered before the session is up are dropped, so keep offering
    let packet = ipv4_packet(CLIENT_ADDR, SERVER_ADDR, 1200);
    let received = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            client_out_tx.send(packet.clone()).await.unwrap();
            if let Ok(Some(got)) = tokio::time::timeout(Duration::from_millis(200), server_in_rx.recv()).await {
                return got;
            }
        }
    })
    .await
    .expect("packet through the tunnel");
    assert_eq!(received, packet);

    drop(client_out_tx);
    tokio::time::timeout(Duration::from_secs(10), client)
        .await
        .expect("client shut down")
        .unwrap()
        .unwrap();

    drop(server_out_tx);
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server shut down")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_client_survives_refused_datagrams() {
    // nothing listens on this port once the socket is gone
    let closed = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let resolver = closed.local_addr().unwrap();
    drop(closed);

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.connect(resolver).await.unwrap();
    let (_out_tx, out_rx) = mpsc::channel(16);
    let (in_tx, _in_rx) = mpsc::channel(16);
    let client = tokio::spawn(transport::run_client(
        ClientEngine::new(config(), Instant::now()).unwrap(),
        socket,
        PacketChannels {
            outbound: out_rx,
            inbound: in_tx,
        },
    ));

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!client.is_finished());
    client.abort();
}
