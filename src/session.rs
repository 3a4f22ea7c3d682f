//! Session state shared by the client and server engines

use crate::auth::Challenge;
use crate::codec::Codec;
use crate::config::TunnelConfig;
use crate::dns::RecordType;
use crate::fragment::Reassembler;
use crate::frame::SessionId;
use crate::window::{ReceiveTracker, SendWindow};
use std::fmt;
use std::net::IpAddr;
use std::time::Instant;

/// Version carried in `Hello`; both ends must agree exactly
pub const PROTOCOL_VERSION: u32 = 0x0000_0001;

/// Random per-client value in `Hello`, so a retried hello gets the same id
pub type HelloToken = [u8; 8];

/// `Hello` payload: `version:4 token:8`
pub const HELLO_LEN: usize = 12;

pub fn encode_hello(token: &HelloToken) -> Vec<u8> {
    let mut out = PROTOCOL_VERSION.to_be_bytes().to_vec();
    out.extend_from_slice(token);
    out
}

/// Split a `Hello` payload into version and token
pub fn decode_hello(data: &[u8]) -> Option<(u32, HelloToken)> {
    if data.len() != HELLO_LEN {
        return None;
    }
    let version = u32::from_be_bytes(data[..4].try_into().ok()?);
    let token = data[4..].try_into().ok()?;
    Some((version, token))
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshaking,
    Negotiating,
    Authenticating,
    Established,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Handshaking => "handshaking",
            SessionState::Negotiating => "negotiating",
            SessionState::Authenticating => "authenticating",
            SessionState::Established => "established",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Bytes the server answers record and fragment-size probes with
pub fn downstream_pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| i as u8).collect()
}

/// Parameters a session settles on during negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub upstream_codec: Codec,
    pub record_type: RecordType,
    pub downstream_codec: Codec,
    /// Payload bytes per client -> server fragment
    pub upstream_fragment_size: usize,
    /// Payload bytes per server -> client fragment
    pub downstream_fragment_size: usize,
}

impl Negotiated {
    pub const WIRE_LEN: usize = 8;

    /// `upstream codec:1 record type:2 downstream codec:1 upstream size:2 downstream size:2`
    pub fn encode(&self) -> Vec<u8> {
        let size = |n: usize| (n.min(usize::from(u16::MAX)) as u16).to_be_bytes();
        let mut out = Vec::with_capacity(Self::WIRE_LEN);
        out.push(self.upstream_codec.id());
        out.extend_from_slice(&self.record_type.code().to_be_bytes());
        out.push(self.downstream_codec.id());
        out.extend_from_slice(&size(self.upstream_fragment_size));
        out.extend_from_slice(&size(self.downstream_fragment_size));
        out
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() != Self::WIRE_LEN {
            return None;
        }
        Some(Self {
            upstream_codec: Codec::from_id(data[0])?,
            record_type: RecordType::from_code(u16::from_be_bytes([data[1], data[2]]))?,
            downstream_codec: Codec::from_id(data[3])?,
            upstream_fragment_size: usize::from(u16::from_be_bytes([data[4], data[5]])),
            downstream_fragment_size: usize::from(u16::from_be_bytes([data[6], data[7]])),
        })
    }
}

/// Server-side view of one client
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub state: SessionState,
    /// Token of the hello that created the session
    pub hello_token: Option<HelloToken>,
    pub negotiated: Option<Negotiated>,
    pub challenge: Option<Challenge>,
    pub auth_failures: u32,
    pub violations: u32,
    pub last_active: Instant,
    /// Source address of the client's tunneled packets
    pub tunnel_addr: Option<IpAddr>,
    pub downstream: SendWindow,
    pub upstream: ReceiveTracker,
    pub reassembler: Reassembler,
}

impl Session {
    pub fn new(id: SessionId, config: &TunnelConfig, now: Instant) -> Self {
        let limits = &config.limits;
        Self {
            id,
            state: SessionState::Negotiating,
            hello_token: None,
            negotiated: None,
            challenge: None,
            auth_failures: 0,
            violations: 0,
            last_active: now,
            tunnel_addr: None,
            downstream: SendWindow::new(
                limits.downstream_window,
                limits.max_queued_fragments,
                config.timing.retransmit_timeout,
            ),
            upstream: ReceiveTracker::new(),
            reassembler: Reassembler::new(limits.max_runs, limits.reassembly_timeout),
        }
    }

    /// Saturating count of downstream fragments not yet acknowledged
    pub fn backlog(&self) -> u8 {
        self.downstream.backlog().min(usize::from(u8::MAX)) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiated_wire_format() {
        let n = Negotiated {
            upstream_codec: Codec::Base128,
            record_type: RecordType::Private,
            downstream_codec: Codec::Raw,
            upstream_fragment_size: 200,
            downstream_fragment_size: 1000,
        };
        let bytes = n.encode();
        assert_eq!(bytes, vec![4, 0xff, 0x77, 0, 0x00, 0xc8, 0x03, 0xe8]);
        assert_eq!(Negotiated::decode(&bytes), Some(n));
        assert_eq!(Negotiated::decode(&bytes[..7]), None);
        assert_eq!(Negotiated::decode(&[9, 0, 10, 0, 0, 1, 0, 1]), None);
    }

    #[test]
    fn test_hello_payload() {
        let token = [1, 2, 3, 4, 5, 6, 7, 8];
        let payload = encode_hello(&token);
        assert_eq!(payload.len(), HELLO_LEN);
        assert_eq!(decode_hello(&payload), Some((PROTOCOL_VERSION, token)));
        assert_eq!(decode_hello(&PROTOCOL_VERSION.to_be_bytes()), None);
    }

    #[test]
    fn test_new_session_negotiates() {
        let config = TunnelConfig::new("t.example.com", "secret");
        let session = Session::new(5, &config, Instant::now());
        assert_eq!(session.state, SessionState::Negotiating);
        assert_eq!(session.backlog(), 0);
        assert_eq!(session.hello_token, None);
    }
}
