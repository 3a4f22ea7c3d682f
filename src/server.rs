//! Server protocol engine
//!
//! `ServerEngine` answers tunnel queries without doing any I/O itself: the
//! transport hands it raw DNS queries and sends back whatever it returns.
//! It owns the session table; nothing is shared between sessions.

use crate::auth::{new_challenge, Authenticator};
use crate::config::TunnelConfig;
use crate::dns::{DnsMessage, MAX_DNS_UDP_SIZE};
use crate::fragment::Fragment;
use crate::frame::{ErrorCode, FrameHeader, FrameKind, Framer, QueryFrame, SessionId, FLAG_MORE};
use crate::session::{decode_hello, downstream_pattern, Negotiated, Session, SessionState, PROTOCOL_VERSION};
use crate::{Result, Topdomain, TunnelError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Instant;

/// Random id attempts before falling back to a scan of the id space
const ID_ATTEMPTS: usize = 32;

/// Source and destination addresses of an IPv4/IPv6 packet
pub fn packet_addrs(packet: &[u8]) -> Option<(IpAddr, IpAddr)> {
    match packet.first()? >> 4 {
        4 if packet.len() >= 20 => {
            let src: [u8; 4] = packet[12..16].try_into().ok()?;
            let dst: [u8; 4] = packet[16..20].try_into().ok()?;
            Some((Ipv4Addr::from(src).into(), Ipv4Addr::from(dst).into()))
        }
        6 if packet.len() >= 40 => {
            let src: [u8; 16] = packet[8..24].try_into().ok()?;
            let dst: [u8; 16] = packet[24..40].try_into().ok()?;
            Some((Ipv6Addr::from(src).into(), Ipv6Addr::from(dst).into()))
        }
        _ => None,
    }
}

/// What to answer a single query with
enum Answer {
    Frame(FrameKind, Vec<u8>),
    Fragment(Fragment),
    Error(ErrorCode),
}

pub struct ServerEngine {
    config: TunnelConfig,
    framer: Framer,
    auth: Authenticator,
    sessions: HashMap<SessionId, Session>,
    inbound: VecDeque<(SessionId, Vec<u8>)>,
    rng: StdRng,
}

impl ServerEngine {
    pub fn new(config: TunnelConfig) -> Result<Self> {
        config.validate()?;
        let framer = Framer::new(Topdomain::new(&config.topdomain)?);
        let auth = Authenticator::new(config.password.as_bytes());
        Ok(Self {
            config,
            framer,
            auth,
            sessions: HashMap::new(),
            inbound: VecDeque::new(),
            rng: StdRng::from_entropy(),
        })
    }

    pub fn framer(&self) -> &Framer {
        &self.framer
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_state(&self, id: SessionId) -> Option<SessionState> {
        self.sessions.get(&id).map(|s| s.state)
    }

    /// Parameters session `id` negotiated, once past negotiation
    pub fn negotiated(&self, id: SessionId) -> Option<Negotiated> {
        self.sessions.get(&id).and_then(|s| s.negotiated)
    }

    /// Next reassembled upstream packet and the session it came from
    pub fn take_inbound(&mut self) -> Option<(SessionId, Vec<u8>)> {
        self.inbound.pop_front()
    }

    /// Queue `packet` for delivery to session `id`. `Ok(false)` means the
    /// session's send queue was full and the packet was dropped.
    pub fn submit_outbound(&mut self, id: SessionId, packet: &[u8]) -> Result<bool> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or_else(|| TunnelError::Protocol(format!("unknown session {:02x}", id)))?;
        match (session.state, session.negotiated) {
            (SessionState::Established, Some(n)) => session.downstream.push_packet(packet, n.downstream_fragment_size),
            (state, _) => Err(TunnelError::Protocol(format!("session {:02x} is {}", id, state))),
        }
    }

    /// Queue `packet` for the session whose tunnel address matches its
    /// destination. Returns the session it was queued on, if any.
    pub fn route_outbound(&mut self, packet: &[u8]) -> Result<Option<SessionId>> {
        let (_, dst) = packet_addrs(packet)
            .ok_or_else(|| TunnelError::Framing("outbound packet is not IPv4 or IPv6".into()))?;
        let id = self
            .sessions
            .values()
            .find(|s| s.state == SessionState::Established && s.tunnel_addr == Some(dst))
            .map(|s| s.id);

        match id {
            Some(id) => Ok(self.submit_outbound(id, packet)?.then_some(id)),
            None => {
                log::debug!("No session for {}, dropping {}-byte packet", dst, packet.len());
                Ok(None)
            }
        }
    }

    /// Earliest instant `handle_timeout` has work to do
    pub fn next_timeout(&self) -> Option<Instant> {
        let idle = self.config.timing.idle_timeout;
        self.sessions.values().map(|s| s.last_active + idle).min()
    }

    /// Drop idle sessions and stale partial packets
    pub fn handle_timeout(&mut self, now: Instant) {
        let idle = self.config.timing.idle_timeout;
        self.sessions.retain(|id, session| {
            let alive = now.saturating_duration_since(session.last_active) <= idle;
            if !alive {
                log::info!("Removing idle session {:02x} ({})", id, session.state);
            }
            alive
        });
        for session in self.sessions.values_mut() {
            session.reassembler.purge(now);
        }
    }

    /// Answer one DNS query. `None` means the query is dropped unanswered.
    pub fn handle_query(&mut self, query: &[u8], now: Instant) -> Option<Vec<u8>> {
        let msg = match DnsMessage::parse(query) {
            Ok(msg) => msg,
            Err(e) => {
                log::debug!("Dropping unparseable query: {}", e);
                return None;
            }
        };
        let on_topdomain = msg
            .question()
            .map(|q| self.framer.is_tunnel_name(&q.qname))
            .unwrap_or(false);
        if !on_topdomain {
            log::debug!("Refusing query outside {}", self.framer.topdomain());
            return Some(DnsMessage::refused(&msg).to_bytes());
        }

        let frame = match self.framer.decode_query(&msg) {
            Ok(frame) => frame,
            Err(e) => {
                log::debug!("Dropping malformed frame: {}", e);
                return None;
            }
        };
        log::trace!("Query header {}", hex::encode(frame.header.encode()));

        let (id, answer) = self.dispatch(&frame, now);
        self.encode_answer(&msg, &frame, id, answer)
    }

    fn message_limit(&self, advertised: Option<u16>) -> usize {
        match advertised {
            Some(size) => usize::from(size)
                .min(self.config.message_limit())
                .max(MAX_DNS_UDP_SIZE),
            None => MAX_DNS_UDP_SIZE,
        }
    }

    fn dispatch(&mut self, frame: &QueryFrame, now: Instant) -> (SessionId, Answer) {
        let kind = frame.header.kind;
        if kind == FrameKind::Hello {
            return self.handle_hello(&frame.payload, now);
        }

        let id = frame.header.session;
        let state = match self.sessions.get_mut(&id) {
            Some(session) => {
                session.last_active = now;
                session.state
            }
            None => {
                log::debug!("{:?} for unknown session {:02x}", kind, id);
                return (id, Answer::Error(ErrorCode::UnknownSession));
            }
        };

        // options and login may be replayed when their answer was lost
        let allowed: &[SessionState] = match kind {
            FrameKind::CodecProbe | FrameKind::RecordProbe | FrameKind::FragProbe => &[SessionState::Negotiating],
            FrameKind::Options => &[SessionState::Negotiating, SessionState::Authenticating],
            FrameKind::AuthRequest | FrameKind::AuthResponse => {
                &[SessionState::Authenticating, SessionState::Established]
            }
            FrameKind::Data | FrameKind::Poll => &[SessionState::Established],
            _ => &[],
        };
        if !allowed.is_empty() && !allowed.contains(&state) {
            self.count_violation(id, "frame in wrong state");
            return (id, Answer::Error(ErrorCode::BadState));
        }

        let answer = match kind {
            FrameKind::Close => {
                log::info!("Session {:02x} closed by client", id);
                self.sessions.remove(&id);
                Answer::Frame(FrameKind::Close, Vec::new())
            }
            FrameKind::CodecProbe => Answer::Frame(FrameKind::CodecProbe, frame.payload.clone()),
            FrameKind::RecordProbe | FrameKind::FragProbe => self.handle_probe(frame),
            FrameKind::Options => self.handle_options(id, state, frame),
            FrameKind::AuthRequest => {
                let challenge = new_challenge(&mut self.rng);
                if let Some(session) = self.sessions.get_mut(&id) {
                    session.challenge = Some(challenge);
                }
                Answer::Frame(FrameKind::AuthRequest, challenge.to_vec())
            }
            FrameKind::AuthResponse => self.handle_auth(id, &frame.payload),
            FrameKind::Data | FrameKind::Poll => self.handle_traffic(id, frame, now),
            FrameKind::Hello | FrameKind::Error => Answer::Error(ErrorCode::BadPayload),
        };
        (id, answer)
    }

    fn handle_hello(&mut self, payload: &[u8], now: Instant) -> (SessionId, Answer) {
        let accept = || Answer::Frame(FrameKind::Hello, PROTOCOL_VERSION.to_be_bytes().to_vec());
        let Some((version, token)) = decode_hello(payload) else {
            return (0, Answer::Error(ErrorCode::BadPayload));
        };
        if version != PROTOCOL_VERSION {
            log::warn!("Rejecting client with protocol version {:08x}", version);
            return (0, Answer::Error(ErrorCode::BadVersion));
        }

        let retried = self
            .sessions
            .values_mut()
            .find(|s| s.state == SessionState::Negotiating && s.hello_token == Some(token));
        if let Some(session) = retried {
            log::debug!("Repeated hello for session {:02x}", session.id);
            session.last_active = now;
            return (session.id, accept());
        }

        if self.sessions.len() >= self.config.limits.max_sessions {
            log::warn!("Session table full ({} sessions)", self.sessions.len());
            return (0, Answer::Error(ErrorCode::ServerFull));
        }

        let Some(id) = self.allocate_id() else {
            return (0, Answer::Error(ErrorCode::ServerFull));
        };
        let mut session = Session::new(id, &self.config, now);
        session.hello_token = Some(token);
        self.sessions.insert(id, session);
        log::info!("New session {:02x}", id);
        (id, accept())
    }

    fn allocate_id(&mut self) -> Option<SessionId> {
        for _ in 0..ID_ATTEMPTS {
            let id: SessionId = self.rng.gen_range(1..=u8::MAX);
            if !self.sessions.contains_key(&id) {
                return Some(id);
            }
        }
        (1..=u8::MAX).find(|id| !self.sessions.contains_key(id))
    }

    /// Record and fragment-size probes: answer the requested number of
    /// pattern bytes in the queried record type
    fn handle_probe(&self, frame: &QueryFrame) -> Answer {
        let len = match <[u8; 2]>::try_from(frame.payload.as_slice()) {
            Ok(bytes) => usize::from(u16::from_be_bytes(bytes)),
            Err(_) => return Answer::Error(ErrorCode::BadPayload),
        };
        let rt = frame.record_type;
        let codec = frame.header.reply_codec;
        if !rt.reply_codecs().contains(&codec) {
            return Answer::Error(ErrorCode::BadOptions);
        }
        let cap = self
            .framer
            .downstream_capacity(rt, codec, self.message_limit(frame.edns));
        if len > cap {
            log::debug!("Probe for {} bytes over {}/{} capacity {}", len, rt, codec, cap);
            return Answer::Error(ErrorCode::TooLarge);
        }
        Answer::Frame(frame.header.kind, downstream_pattern(len))
    }

    fn handle_options(&mut self, id: SessionId, state: SessionState, frame: &QueryFrame) -> Answer {
        let Some(options) = Negotiated::decode(&frame.payload) else {
            return Answer::Error(ErrorCode::BadPayload);
        };
        if state == SessionState::Authenticating {
            let stored = self.sessions.get(&id).and_then(|s| s.negotiated);
            if stored == Some(options) {
                log::debug!("Session {:02x} repeated its options", id);
                return Answer::Frame(FrameKind::Options, Vec::new());
            }
            self.count_violation(id, "options changed after negotiation");
            return Answer::Error(ErrorCode::BadState);
        }

        let cap = self.framer.downstream_capacity(
            options.record_type,
            options.downstream_codec,
            self.message_limit(frame.edns),
        );
        let valid = options.upstream_codec.is_label_safe()
            && options.upstream_fragment_size > 0
            && options.upstream_fragment_size <= self.framer.upstream_capacity(options.upstream_codec)
            && options
                .record_type
                .reply_codecs()
                .contains(&options.downstream_codec)
            && options.downstream_fragment_size > 0
            && options.downstream_fragment_size <= cap;
        if !valid {
            log::warn!("Session {:02x} sent unusable options {:?}", id, options);
            return Answer::Error(ErrorCode::BadOptions);
        }

        if let Some(session) = self.sessions.get_mut(&id) {
            log::info!(
                "Session {:02x} negotiated {} up ({}-byte fragments), {}/{} down ({}-byte fragments)",
                id,
                options.upstream_codec,
                options.upstream_fragment_size,
                options.record_type,
                options.downstream_codec,
                options.downstream_fragment_size
            );
            session.negotiated = Some(options);
            session.state = SessionState::Authenticating;
        }
        Answer::Frame(FrameKind::Options, Vec::new())
    }

    fn handle_auth(&mut self, id: SessionId, response: &[u8]) -> Answer {
        let max_attempts = self.config.limits.max_auth_attempts;
        let Some(session) = self.sessions.get_mut(&id) else {
            return Answer::Error(ErrorCode::UnknownSession);
        };
        // a response without an outstanding challenge counts as a failure
        let verified = session
            .challenge
            .take()
            .is_some_and(|challenge| self.auth.verify(&challenge, id, response));
        if verified {
            if session.state == SessionState::Established {
                log::debug!("Session {:02x} logged in again", id);
            } else {
                log::info!("Session {:02x} authenticated", id);
            }
            session.state = SessionState::Established;
            return Answer::Frame(FrameKind::AuthResponse, Vec::new());
        }

        session.auth_failures += 1;
        log::warn!(
            "Session {:02x} failed login ({}/{})",
            id,
            session.auth_failures,
            max_attempts
        );
        if session.auth_failures >= max_attempts {
            self.sessions.remove(&id);
            return Answer::Error(ErrorCode::AuthExhausted);
        }
        Answer::Error(ErrorCode::AuthFailed)
    }

    fn handle_traffic(&mut self, id: SessionId, frame: &QueryFrame, now: Instant) -> Answer {
        let Some(session) = self.sessions.get_mut(&id) else {
            return Answer::Error(ErrorCode::UnknownSession);
        };
        if let Some(ack) = frame.header.ack() {
            session.downstream.ack(ack, now);
        }

        if frame.header.kind == FrameKind::Data && session.upstream.accept(frame.header.seq) {
            let fragment = frame.header.to_fragment(frame.payload.clone());
            match session.reassembler.insert(fragment, now) {
                Ok(Some(packet)) => {
                    if let Some((src, _)) = packet_addrs(&packet) {
                        if session.tunnel_addr != Some(src) {
                            log::info!("Session {:02x} uses tunnel address {}", id, src);
                            session.tunnel_addr = Some(src);
                        }
                    }
                    log::debug!("Session {:02x}: {}-byte packet in", id, packet.len());
                    self.inbound.push_back((id, packet));
                }
                Ok(None) => {}
                Err(e) if e.is_frame_local() => {
                    log::debug!("Session {:02x}: dropped fragment: {}", id, e);
                }
                Err(e) => {
                    log::warn!("Session {:02x}: {}", id, e);
                    if self.count_violation(id, "bad fragment") {
                        return Answer::Error(ErrorCode::BadState);
                    }
                }
            }
        }

        match self.sessions.get_mut(&id).and_then(|s| s.downstream.next(now)) {
            Some(fragment) => Answer::Fragment(fragment),
            None => Answer::Frame(FrameKind::Poll, Vec::new()),
        }
    }

    /// Count a protocol violation; returns `true` when the session was torn down
    fn count_violation(&mut self, id: SessionId, what: &str) -> bool {
        let max = self.config.limits.max_protocol_violations;
        let Some(session) = self.sessions.get_mut(&id) else {
            return false;
        };
        session.violations += 1;
        log::debug!("Session {:02x}: {} ({}/{})", id, what, session.violations, max);
        if session.violations >= max {
            log::warn!("Tearing down session {:02x} after {} protocol errors", id, session.violations);
            self.sessions.remove(&id);
            return true;
        }
        false
    }

    fn encode_answer(&self, msg: &DnsMessage, frame: &QueryFrame, id: SessionId, answer: Answer) -> Option<Vec<u8>> {
        let (header, payload) = match answer {
            Answer::Frame(kind, payload) => (FrameHeader::new(kind, id), payload),
            Answer::Fragment(fragment) => (FrameHeader::for_fragment(id, &fragment), fragment.data),
            Answer::Error(code) => (FrameHeader::new(FrameKind::Error, id), vec![code.code()]),
        };
        let query = &frame.header;
        let mut header = header.with_codecs(query.payload_codec, query.reply_codec);
        header.nonce = query.nonce;

        if matches!(header.kind, FrameKind::Data | FrameKind::Poll) {
            if let Some(session) = self.sessions.get(&id) {
                header = header.with_ack(session.upstream.ack());
                header.backlog = session.backlog();
                if session.downstream.queued() > 0 {
                    header.flags |= FLAG_MORE;
                }
            }
        }
        log::trace!("Reply header {}", hex::encode(header.encode()));

        let limit = self.message_limit(frame.edns);
        match self.framer.encode_reply(msg, frame.record_type, &header, &payload, limit) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                log::debug!("Cannot encode {:?} reply for session {:02x}: {}", header.kind, id, e);
                None
            }
        }
    }
}
