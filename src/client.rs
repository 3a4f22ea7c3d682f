//! Client protocol engine
//!
//! `ClientEngine` produces DNS queries and consumes their answers; the caller
//! moves the bytes. After the handshake it negotiates, one probe at a time,
//! the densest upstream codec, downstream record type/codec and fragment size
//! the resolver path carries intact, logs in, then exchanges traffic. Every
//! control exchange is bounded by a timer.

use crate::auth::{Authenticator, Challenge, CHALLENGE_LEN};
use crate::codec::Codec;
use crate::config::TunnelConfig;
use crate::dns::{DnsMessage, RecordType, MAX_DNS_UDP_SIZE};
use crate::fragment::Reassembler;
use crate::frame::{ErrorCode, FrameHeader, FrameKind, Framer, ReplyFrame, SessionId};
use crate::session::{downstream_pattern, encode_hello, HelloToken, Negotiated, SessionState};
use crate::window::{PollPacer, ReceiveTracker, SendWindow};
use crate::{Result, Topdomain, TunnelError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Control exchanges run over TXT with base32 replies, which every resolver
/// path that forwards TXT carries
const CONTROL_RECORD: RecordType = RecordType::Txt;
const CONTROL_CODEC: Codec = Codec::Base32;

/// Where the client is in setting up or running the session
#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    Hello,
    CodecProbe(usize),
    RecordProbe(usize),
    FragProbe(usize),
    Options,
    AuthRequest,
    AuthResponse(Challenge),
    Traffic,
    Close,
}

/// The control query currently awaiting an answer
#[derive(Debug)]
struct Pending {
    id: u16,
    deadline: Instant,
    record_type: RecordType,
    reply_codec: Codec,
    expected: Option<Vec<u8>>,
}

pub struct ClientEngine {
    config: TunnelConfig,
    framer: Framer,
    auth: Authenticator,
    state: SessionState,
    session: SessionId,
    /// Lets the server recognise a repeated hello
    hello_token: HelloToken,
    step: Step,
    pending: Option<Pending>,
    /// Timeouts of the current retried step (hello, options, login)
    retries: u32,
    auth_failures: u32,

    upstream_codec: Codec,
    record_candidates: Vec<(RecordType, Codec)>,
    fragment_candidates: Vec<usize>,
    downstream: Option<(RecordType, Codec)>,
    negotiated: Option<Negotiated>,

    sender: SendWindow,
    receiver: ReceiveTracker,
    reassembler: Reassembler,
    pacer: PollPacer,
    in_flight: HashMap<u16, Instant>,
    last_query: Option<Instant>,
    last_heard: Instant,
    last_ack_sent: Option<u16>,
    server_more: bool,
    inbound: VecDeque<Vec<u8>>,
    nonce: u16,
    rng: StdRng,
}

impl ClientEngine {
    pub fn new(config: TunnelConfig, now: Instant) -> Result<Self> {
        config.validate()?;
        let framer = Framer::new(Topdomain::new(&config.topdomain)?);
        let auth = Authenticator::new(config.password.as_bytes());
        let limits = &config.limits;
        let sender = SendWindow::new(
            limits.upstream_window,
            limits.max_queued_fragments,
            config.timing.retransmit_timeout,
        );
        let reassembler = Reassembler::new(limits.max_runs, limits.reassembly_timeout);
        let pacer = PollPacer::new(config.timing.min_poll_interval, config.timing.keepalive_interval);
        let mut rng = StdRng::from_entropy();
        let nonce = rng.gen();
        let hello_token = rng.gen();

        Ok(Self {
            config,
            framer,
            auth,
            state: SessionState::Handshaking,
            session: 0,
            hello_token,
            step: Step::Hello,
            pending: None,
            retries: 0,
            auth_failures: 0,
            upstream_codec: Codec::Base32,
            record_candidates: Vec::new(),
            fragment_candidates: Vec::new(),
            downstream: None,
            negotiated: None,
            sender,
            receiver: ReceiveTracker::new(),
            reassembler,
            pacer,
            in_flight: HashMap::new(),
            last_query: None,
            last_heard: now,
            last_ack_sent: None,
            server_more: false,
            inbound: VecDeque::new(),
            nonce,
            rng,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session_id(&self) -> Option<SessionId> {
        (self.session != 0).then_some(self.session)
    }

    /// Negotiated parameters, once negotiation finished
    pub fn negotiated(&self) -> Option<Negotiated> {
        self.negotiated
    }

    /// Next packet received through the tunnel
    pub fn take_inbound(&mut self) -> Option<Vec<u8>> {
        self.inbound.pop_front()
    }

    /// Queue a packet for the server. `Ok(false)` means it was dropped: the
    /// session is not established yet or the send queue is full.
    pub fn submit_outbound(&mut self, packet: &[u8]) -> Result<bool> {
        let Some(negotiated) = self.negotiated.filter(|_| self.state == SessionState::Established) else {
            log::warn!("Session not established ({}), dropping {}-byte packet", self.state, packet.len());
            return Ok(false);
        };
        let queued = self.sender.push_packet(packet, negotiated.upstream_fragment_size)?;
        self.pacer.reset();
        Ok(queued)
    }

    /// Start an orderly shutdown. Later calls are no-ops.
    pub fn close(&mut self) {
        match self.state {
            SessionState::Closing | SessionState::Closed => {}
            SessionState::Handshaking => self.state = SessionState::Closed,
            _ => {
                log::info!("Closing session {:02x}", self.session);
                self.state = SessionState::Closing;
                self.step = Step::Close;
                self.pending = None;
                self.retries = 0;
            }
        }
    }

    /// Earliest instant at which `handle_timeout` or `poll_query` has work
    pub fn next_timeout(&self) -> Option<Instant> {
        if self.state == SessionState::Closed {
            return None;
        }
        let idle = self.last_heard + self.config.timing.idle_timeout;
        let mut next = match &self.pending {
            Some(pending) => pending.deadline.min(idle),
            None => idle,
        };
        if self.step == Step::Traffic {
            if let Some(at) = self.next_poll_at().filter(|_| self.in_flight.is_empty()) {
                next = next.min(at);
            }
            if let Some(at) = self.sender.next_deadline() {
                next = next.min(at);
            }
        }
        // lost traffic queries stop blocking polls once they expire
        let probe_timeout = self.config.timing.probe_timeout;
        if let Some(sent) = self.in_flight.values().min() {
            next = next.min(*sent + probe_timeout);
        }
        Some(next)
    }

    /// Expire the outstanding control query and detect a silent server
    pub fn handle_timeout(&mut self, now: Instant) -> Result<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        if now.saturating_duration_since(self.last_heard) >= self.config.timing.idle_timeout {
            return self.fail(TunnelError::Timeout(format!(
                "no answer from the server for {}",
                humantime::format_duration(self.config.timing.idle_timeout)
            )));
        }

        let probe_timeout = self.config.timing.probe_timeout;
        self.in_flight
            .retain(|_, sent| now.saturating_duration_since(*sent) < probe_timeout);
        self.reassembler.purge(now);

        let expired = self.pending.as_ref().is_some_and(|p| p.deadline <= now);
        if !expired {
            return Ok(());
        }
        log::debug!("{:?} timed out", self.step);
        self.pending = None;
        self.step_failed()
    }

    /// The next query to send, if one is due
    pub fn poll_query(&mut self, now: Instant) -> Result<Option<Vec<u8>>> {
        match self.state {
            SessionState::Closed => Ok(None),
            _ if self.step == Step::Traffic => self.traffic_query(now),
            _ if self.pending.is_some() => Ok(None),
            _ => self.control_query(now).map(Some),
        }
    }

    /// Process one DNS answer
    pub fn handle_response(&mut self, response: &[u8], now: Instant) -> Result<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        let id = match DnsMessage::parse(response) {
            Ok(msg) => msg.header.id,
            Err(e) => {
                log::debug!("Dropping unparseable response: {}", e);
                return Ok(());
            }
        };

        let answers_pending = self.pending.as_ref().is_some_and(|p| p.id == id);
        let pending = if answers_pending { self.pending.take() } else { None };
        if let Some(pending) = pending {
            self.last_heard = now;
            let reply = self
                .framer
                .decode_reply(response, pending.record_type, pending.reply_codec);
            return self.control_reply(pending, reply);
        }

        if self.step == Step::Traffic && self.in_flight.remove(&id).is_some() {
            return match self.framer.decode_reply(response, self.traffic_record(), self.traffic_codec()) {
                Ok(reply) => {
                    self.last_heard = now;
                    self.traffic_reply(reply, now)
                }
                Err(e) => {
                    log::debug!("Dropping undecodable reply: {}", e);
                    Ok(())
                }
            };
        }

        log::debug!("Dropping unexpected response {:04x}", id);
        Ok(())
    }

    fn fail(&mut self, error: TunnelError) -> Result<()> {
        log::error!("Session {:02x} failed: {}", self.session, error);
        self.state = SessionState::Closed;
        self.pending = None;
        Err(error)
    }

    fn next_id(&mut self) -> u16 {
        self.rng.gen()
    }

    fn next_nonce(&mut self) -> u16 {
        self.nonce = self.nonce.wrapping_add(1);
        self.nonce
    }

    fn traffic_record(&self) -> RecordType {
        self.negotiated.map_or(CONTROL_RECORD, |n| n.record_type)
    }

    fn traffic_codec(&self) -> Codec {
        self.negotiated.map_or(CONTROL_CODEC, |n| n.downstream_codec)
    }

    fn encode(&mut self, mut header: FrameHeader, payload: &[u8], record_type: RecordType) -> Result<(u16, Vec<u8>)> {
        header.nonce = self.next_nonce();
        let id = self.next_id();
        log::trace!("Query header {}", hex::encode(header.encode()));
        let query = self
            .framer
            .encode_query(&header, payload, record_type, id, self.config.edns_payload_size)?;
        Ok((id, query))
    }

    // ---- negotiation ----

    fn control_query(&mut self, now: Instant) -> Result<Vec<u8>> {
        let timing = &self.config.timing;
        let timeout = match self.step {
            Step::Hello => timing.handshake_timeout,
            _ => timing.probe_timeout,
        };
        let mut record_type = CONTROL_RECORD;
        let mut reply_codec = CONTROL_CODEC;
        let mut payload_codec = self.upstream_codec;
        let mut expected = None;

        let (kind, payload) = match self.step.clone() {
            Step::Hello => (FrameKind::Hello, encode_hello(&self.hello_token)),
            Step::CodecProbe(i) => {
                let codec = self.config.codecs[i];
                let room = self
                    .framer
                    .upstream_capacity(codec)
                    .min(self.framer.downstream_capacity(CONTROL_RECORD, CONTROL_CODEC, MAX_DNS_UDP_SIZE));
                let pattern = codec.probe_pattern(room)?;
                payload_codec = codec;
                expected = Some(pattern.clone());
                (FrameKind::CodecProbe, pattern)
            }
            Step::RecordProbe(i) => {
                let (rt, codec) = self.record_candidates[i];
                let len = self.framer.downstream_capacity(rt, codec, MAX_DNS_UDP_SIZE);
                record_type = rt;
                reply_codec = codec;
                expected = Some(downstream_pattern(len));
                (FrameKind::RecordProbe, (len as u16).to_be_bytes().to_vec())
            }
            Step::FragProbe(i) => {
                let size = self.fragment_candidates[i];
                if let Some((rt, codec)) = self.downstream {
                    record_type = rt;
                    reply_codec = codec;
                }
                expected = Some(downstream_pattern(size));
                (FrameKind::FragProbe, (size as u16).to_be_bytes().to_vec())
            }
            Step::Options => {
                let negotiated = self
                    .negotiated
                    .ok_or_else(|| TunnelError::Protocol("options before negotiation finished".into()))?;
                (FrameKind::Options, negotiated.encode())
            }
            Step::AuthRequest => (FrameKind::AuthRequest, Vec::new()),
            Step::AuthResponse(challenge) => (FrameKind::AuthResponse, self.auth.respond(&challenge, self.session)),
            Step::Close => (FrameKind::Close, Vec::new()),
            Step::Traffic => return Err(TunnelError::Protocol("no control exchange while established".into())),
        };

        let header = FrameHeader::new(kind, self.session).with_codecs(payload_codec, reply_codec);
        let (id, query) = self.encode(header, &payload, record_type)?;
        log::debug!("Sending {:?} ({} bytes)", self.step, query.len());
        self.pending = Some(Pending {
            id,
            deadline: now + timeout,
            record_type,
            reply_codec,
            expected,
        });
        self.last_query = Some(now);
        Ok(query)
    }

    fn control_reply(&mut self, pending: Pending, reply: Result<ReplyFrame>) -> Result<()> {
        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                log::debug!("{:?} answer unusable: {}", self.step, e);
                return self.step_failed();
            }
        };

        if reply.header.kind == FrameKind::Error {
            let code = reply.payload.first().copied().and_then(ErrorCode::from_code);
            return self.control_error(code);
        }

        let matches = pending
            .expected
            .as_ref()
            .map_or(true, |expected| *expected == reply.payload);
        if !matches {
            log::debug!("{:?} came back altered", self.step);
            return self.step_failed();
        }

        match self.step.clone() {
            Step::Hello if reply.header.kind == FrameKind::Hello && reply.header.session != 0 => {
                self.session = reply.header.session;
                self.state = SessionState::Negotiating;
                log::info!("Handshake done, session {:02x}", self.session);
                self.enter(Step::CodecProbe(0));
            }
            Step::CodecProbe(i) if reply.header.kind == FrameKind::CodecProbe => {
                self.upstream_codec = self.config.codecs[i];
                log::info!("Upstream codec {}", self.upstream_codec);
                self.record_candidates = self.record_candidates();
                if self.record_candidates.is_empty() {
                    return self.fail(TunnelError::Capability("no usable downstream record type".into()));
                }
                self.enter(Step::RecordProbe(0));
            }
            Step::RecordProbe(i) if reply.header.kind == FrameKind::RecordProbe => {
                let (rt, codec) = self.record_candidates[i];
                log::info!("Downstream {} records, {} encoded", rt, codec);
                self.downstream = Some((rt, codec));
                self.fragment_candidates = self.fragment_candidates(rt, codec);
                if self.fragment_candidates.is_empty() {
                    return self.fail(TunnelError::Capability("no room for downstream fragments".into()));
                }
                self.enter(Step::FragProbe(0));
            }
            Step::FragProbe(i) if reply.header.kind == FrameKind::FragProbe => {
                let (record_type, downstream_codec) = self.downstream.unwrap_or((CONTROL_RECORD, CONTROL_CODEC));
                let downstream_fragment_size = self.fragment_candidates[i];
                let upstream_fragment_size = self.upstream_fragment_size();
                log::info!(
                    "Fragment sizes {} up, {} down",
                    upstream_fragment_size,
                    downstream_fragment_size
                );
                self.negotiated = Some(Negotiated {
                    upstream_codec: self.upstream_codec,
                    record_type,
                    downstream_codec,
                    upstream_fragment_size,
                    downstream_fragment_size,
                });
                self.enter(Step::Options);
            }
            Step::Options if reply.header.kind == FrameKind::Options => {
                self.state = SessionState::Authenticating;
                self.enter(Step::AuthRequest);
            }
            Step::AuthRequest if reply.header.kind == FrameKind::AuthRequest => {
                match Challenge::try_from(reply.payload.as_slice()) {
                    Ok(challenge) => self.enter(Step::AuthResponse(challenge)),
                    Err(_) => {
                        log::debug!("Challenge of {} bytes, expected {}", reply.payload.len(), CHALLENGE_LEN);
                        return self.step_failed();
                    }
                }
            }
            Step::AuthResponse(_) if reply.header.kind == FrameKind::AuthResponse => {
                log::info!("Session {:02x} established", self.session);
                self.state = SessionState::Established;
                self.last_query = None;
                self.enter(Step::Traffic);
            }
            Step::Close => {
                log::info!("Session {:02x} closed", self.session);
                self.state = SessionState::Closed;
            }
            step => {
                log::debug!("Unexpected {:?} reply during {:?}", reply.header.kind, step);
                return self.step_failed();
            }
        }
        Ok(())
    }

    fn control_error(&mut self, code: Option<ErrorCode>) -> Result<()> {
        match (code, &self.step) {
            (_, Step::Close) => {
                self.state = SessionState::Closed;
                Ok(())
            }
            (Some(ErrorCode::BadVersion), _) => {
                self.fail(TunnelError::Protocol("server runs a different protocol version".into()))
            }
            (Some(ErrorCode::ServerFull), _) => self.fail(TunnelError::Protocol("server has no free sessions".into())),
            (Some(ErrorCode::UnknownSession), _) => {
                self.fail(TunnelError::Protocol(format!("server dropped session {:02x}", self.session)))
            }
            (Some(ErrorCode::BadOptions), Step::Options) => {
                self.fail(TunnelError::Capability("server rejected the negotiated options".into()))
            }
            (Some(ErrorCode::AuthExhausted), _) => self.fail(TunnelError::Authentication("login attempts exhausted".into())),
            (Some(ErrorCode::AuthFailed), Step::AuthResponse(_)) => {
                self.auth_failures += 1;
                if self.auth_failures >= self.config.limits.max_auth_attempts {
                    return self.fail(TunnelError::Authentication("wrong password".into()));
                }
                log::warn!(
                    "Login rejected ({}/{}), retrying",
                    self.auth_failures,
                    self.config.limits.max_auth_attempts
                );
                self.enter(Step::AuthRequest);
                Ok(())
            }
            (code, _) => {
                log::debug!("{:?} answered with error {:?}", self.step, code);
                self.step_failed()
            }
        }
    }

    /// Move on after a failed or timed-out control exchange
    fn step_failed(&mut self) -> Result<()> {
        match self.step.clone() {
            Step::CodecProbe(i) if i + 1 < self.config.codecs.len() => self.enter(Step::CodecProbe(i + 1)),
            Step::CodecProbe(_) => {
                return self.fail(TunnelError::Capability("no upstream codec survives the resolver path".into()))
            }
            Step::RecordProbe(i) if i + 1 < self.record_candidates.len() => self.enter(Step::RecordProbe(i + 1)),
            Step::RecordProbe(_) => {
                return self.fail(TunnelError::Capability("no downstream record type survives the resolver path".into()))
            }
            Step::FragProbe(i) if i + 1 < self.fragment_candidates.len() => self.enter(Step::FragProbe(i + 1)),
            Step::FragProbe(_) => {
                return self.fail(TunnelError::Capability("no downstream fragment size gets through".into()))
            }
            Step::Close => {
                log::info!("Session {:02x} closed without acknowledgement", self.session);
                self.state = SessionState::Closed;
            }
            Step::Traffic => {}
            step => {
                self.retries += 1;
                if self.retries > self.config.limits.handshake_retries {
                    return self.fail(TunnelError::Timeout(format!("{:?} got no usable answer", step)));
                }
                let step = match step {
                    // a fresh challenge is needed after a lost response
                    Step::AuthResponse(_) => Step::AuthRequest,
                    step => step,
                };
                log::debug!("Retrying {:?} ({}/{})", step, self.retries, self.config.limits.handshake_retries);
                self.step = step;
            }
        }
        Ok(())
    }

    fn enter(&mut self, step: Step) {
        self.step = step;
        self.retries = 0;
        self.pending = None;
    }

    fn record_candidates(&self) -> Vec<(RecordType, Codec)> {
        self.config
            .record_types
            .iter()
            .flat_map(|&rt| rt.reply_codecs().iter().map(move |&codec| (rt, codec)))
            .filter(|&(rt, codec)| self.framer.downstream_capacity(rt, codec, MAX_DNS_UDP_SIZE) > 0)
            .collect()
    }

    fn fragment_candidates(&self, rt: RecordType, codec: Codec) -> Vec<usize> {
        let mut cap = self.framer.downstream_capacity(rt, codec, self.config.message_limit());
        if let Some(max) = self.config.max_fragment_size {
            cap = cap.min(max);
        }
        let cap = cap.min(usize::from(u16::MAX));
        let mut sizes: Vec<usize> = [cap, cap * 3 / 4, cap / 2, cap / 4]
            .into_iter()
            .filter(|&size| size > 0)
            .collect();
        sizes.dedup();
        sizes
    }

    fn upstream_fragment_size(&self) -> usize {
        let cap = self.framer.upstream_capacity(self.upstream_codec);
        self.config.max_upstream_fragment_size.map_or(cap, |max| cap.min(max))
    }

    // ---- established traffic ----

    /// Gap before the next poll; short while the server has more for us or
    /// an acknowledgement is owed
    fn poll_gap(&self) -> Duration {
        if self.server_more || self.receiver.ack() != self.last_ack_sent {
            self.config.timing.min_poll_interval
        } else {
            self.pacer.interval()
        }
    }

    fn next_poll_at(&self) -> Option<Instant> {
        self.last_query.map(|at| at + self.poll_gap())
    }

    fn traffic_query(&mut self, now: Instant) -> Result<Option<Vec<u8>>> {
        let Some(negotiated) = self.negotiated else {
            return Ok(None);
        };
        if self.state != SessionState::Established {
            return Ok(None);
        }

        let (header, payload) = match self.sender.next(now) {
            Some(fragment) => {
                let header = FrameHeader::for_fragment(self.session, &fragment);
                (header, fragment.data)
            }
            None => {
                let due = self.in_flight.is_empty() && self.next_poll_at().map_or(true, |at| now >= at);
                if !due {
                    return Ok(None);
                }
                (FrameHeader::new(FrameKind::Poll, self.session), Vec::new())
            }
        };

        let ack = self.receiver.ack();
        let header = header
            .with_codecs(negotiated.upstream_codec, negotiated.downstream_codec)
            .with_ack(ack);
        let kind = header.kind;
        let (id, query) = self.encode(header, &payload, negotiated.record_type)?;
        log::debug!("Sending {:?} with {} bytes", kind, payload.len());

        self.in_flight.insert(id, now);
        self.last_query = Some(now);
        self.last_ack_sent = ack;
        Ok(Some(query))
    }

    fn traffic_reply(&mut self, reply: ReplyFrame, now: Instant) -> Result<()> {
        let header = &reply.header;
        if header.kind == FrameKind::Error {
            let code = reply.payload.first().copied().and_then(ErrorCode::from_code);
            if code == Some(ErrorCode::UnknownSession) {
                return self.fail(TunnelError::Protocol(format!("server dropped session {:02x}", self.session)));
            }
            log::debug!("Server answered error {:?}", code);
            return Ok(());
        }

        if let Some(ack) = header.ack() {
            self.sender.ack(ack, now);
        }
        self.server_more = header.more_pending();
        log::trace!("Server backlog {}", header.backlog);

        let mut got_data = false;
        if header.kind == FrameKind::Data && self.receiver.accept(header.seq) {
            got_data = true;
            let fragment = header.to_fragment(reply.payload);
            match self.reassembler.insert(fragment, now) {
                Ok(Some(packet)) => {
                    log::debug!("{}-byte packet in", packet.len());
                    self.inbound.push_back(packet);
                }
                Ok(None) => {}
                Err(e) => log::warn!("Dropped downstream fragment: {}", e),
            }
        }

        if got_data || self.server_more || !self.sender.is_idle() {
            self.pacer.reset();
        } else {
            self.pacer.backoff();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{HELLO_LEN, PROTOCOL_VERSION};

    fn engine(now: Instant) -> ClientEngine {
        ClientEngine::new(TunnelConfig::new("t.example.com", "secret"), now).unwrap()
    }

    fn sent_frame(client: &ClientEngine, query: &[u8]) -> crate::frame::QueryFrame {
        client.framer.decode_query(&DnsMessage::parse(query).unwrap()).unwrap()
    }

    #[test]
    fn test_first_query_is_hello() {
        let now = Instant::now();
        let mut client = engine(now);
        assert_eq!(client.state(), SessionState::Handshaking);
        assert_eq!(client.session_id(), None);

        let query = client.poll_query(now).unwrap().unwrap();
        let frame = sent_frame(&client, &query);
        assert_eq!(frame.header.kind, FrameKind::Hello);
        assert_eq!(frame.payload.len(), HELLO_LEN);
        assert_eq!(frame.payload[..4], PROTOCOL_VERSION.to_be_bytes());
        assert_eq!(frame.record_type, RecordType::Txt);
        assert_eq!(frame.edns, Some(1232));

        // one control exchange at a time
        assert!(client.poll_query(now).unwrap().is_none());
    }

    #[test]
    fn test_packets_dropped_before_established() {
        let mut client = engine(Instant::now());
        assert!(!client.submit_outbound(&[0x45; 40]).unwrap());
    }

    #[test]
    fn test_hello_retries_then_times_out() {
        let start = Instant::now();
        let mut client = engine(start);
        let mut now = start;

        for _ in 0..=client.config.limits.handshake_retries {
            assert!(client.poll_query(now).unwrap().is_some());
            now = client.next_timeout().unwrap();
            if client.handle_timeout(now).is_err() {
                break;
            }
        }
        assert_eq!(client.state(), SessionState::Closed);
        assert!(client.poll_query(now).unwrap().is_none());
    }

    #[test]
    fn test_close_before_handshake() {
        let mut client = engine(Instant::now());
        client.close();
        assert_eq!(client.state(), SessionState::Closed);
        assert!(client.next_timeout().is_none());
    }

    #[test]
    fn test_fragment_candidates_capped() {
        let mut config = TunnelConfig::new("t.example.com", "secret");
        config.max_fragment_size = Some(200);
        let client = ClientEngine::new(config, Instant::now()).unwrap();
        assert_eq!(
            client.fragment_candidates(RecordType::Null, Codec::Raw),
            vec![200, 150, 100, 50]
        );

        let client = engine(Instant::now());
        assert_eq!(
            client.fragment_candidates(RecordType::Null, Codec::Raw),
            vec![934, 700, 467, 233]
        );
    }

    #[test]
    fn test_upstream_fragment_size_capped() {
        let mut client = engine(Instant::now());
        client.upstream_codec = Codec::Base128;
        assert_eq!(client.upstream_fragment_size(), 185);

        let mut config = TunnelConfig::new("t.example.com", "secret");
        config.max_upstream_fragment_size = Some(200);
        let mut client = ClientEngine::new(config, Instant::now()).unwrap();
        client.upstream_codec = Codec::Base32;
        assert_eq!(client.upstream_fragment_size(), client.framer.upstream_capacity(Codec::Base32));
        client.upstream_codec = Codec::Base128;
        assert_eq!(client.upstream_fragment_size(), 185);

        let mut config = TunnelConfig::new("t.example.com", "secret");
        config.max_upstream_fragment_size = Some(100);
        let mut client = ClientEngine::new(config, Instant::now()).unwrap();
        client.upstream_codec = Codec::Base128;
        assert_eq!(client.upstream_fragment_size(), 100);
    }

    #[test]
    fn test_stray_responses_ignored() {
        let now = Instant::now();
        let mut client = engine(now);
        client.poll_query(now).unwrap();

        assert!(client.handle_response(b"garbage", now).is_ok());
        let stray = DnsMessage::new_query(1, crate::dns::labels_from_str("x.example.org"), 16, None);
        assert!(client.handle_response(&stray.to_bytes(), now).is_ok());
        assert_eq!(client.state(), SessionState::Handshaking);
    }
}
