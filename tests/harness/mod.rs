//! In-memory resolver path between a client and a server engine, driven by
//! a synthetic clock

#![allow(dead_code)]

use dnstun::dns::DnsMessage;
use dnstun::frame::{FrameKind, QueryFrame, ReplyFrame};
use dnstun::{ClientEngine, Framer, ServerEngine, SessionState, TunnelConfig, TunnelError};
use std::time::{Duration, Instant};

pub const TOP: &str = "t.example.com";
pub const PASSWORD: &str = "hunter2";

/// Decides whether the resolver forwards a query to the server
pub type Filter = Box<dyn FnMut(&QueryFrame) -> bool>;

/// Decides whether the resolver hands an answer back to the client
pub type AnswerFilter = Box<dyn FnMut(&QueryFrame, &ReplyFrame) -> bool>;

pub struct Harness {
    pub client: ClientEngine,
    pub server: ServerEngine,
    pub now: Instant,
    pub framer: Framer,
    /// Queries the client sent, by frame kind
    pub sent: Vec<FrameKind>,
    filter: Filter,
    answer_filter: AnswerFilter,
}

pub fn config() -> TunnelConfig {
    TunnelConfig::new(TOP, PASSWORD)
}

impl Harness {
    pub fn new(client: TunnelConfig, server: TunnelConfig) -> Self {
        let now = Instant::now();
        let server = ServerEngine::new(server).unwrap();
        let framer = server.framer().clone();
        Self {
            client: ClientEngine::new(client, now).unwrap(),
            server,
            now,
            framer,
            sent: Vec::new(),
            filter: Box::new(|_| true),
            answer_filter: Box::new(|_, _| true),
        }
    }

    pub fn with_filter(mut self, filter: impl FnMut(&QueryFrame) -> bool + 'static) -> Self {
        self.filter = Box::new(filter);
        self
    }

    pub fn set_filter(&mut self, filter: impl FnMut(&QueryFrame) -> bool + 'static) {
        self.filter = Box::new(filter);
    }

    pub fn with_answer_filter(mut self, filter: impl FnMut(&QueryFrame, &ReplyFrame) -> bool + 'static) -> Self {
        self.answer_filter = Box::new(filter);
        self
    }

    pub fn set_answer_filter(&mut self, filter: impl FnMut(&QueryFrame, &ReplyFrame) -> bool + 'static) {
        self.answer_filter = Box::new(filter);
    }

    /// Send every due query through the resolver path, or advance the clock
    /// to the next timer when nothing is due. Returns the number of queries sent.
    pub fn step(&mut self) -> Result<usize, TunnelError> {
        let mut sent = 0;
        while let Some(query) = self.client.poll_query(self.now)? {
            sent += 1;
            let msg = DnsMessage::parse(&query).unwrap();
            let frame = self.framer.decode_query(&msg).unwrap();
            self.sent.push(frame.header.kind);
            if !(self.filter)(&frame) {
                continue;
            }
            let Some(reply) = self.server.handle_query(&query, self.now) else {
                continue;
            };
            // answers that do not decode as frames always get through
            let deliver = match self.framer.decode_reply(&reply, frame.record_type, frame.header.reply_codec) {
                Ok(answer) => (self.answer_filter)(&frame, &answer),
                Err(_) => true,
            };
            if deliver {
                self.client.handle_response(&reply, self.now)?;
            }
        }
        if sent > 0 {
            return Ok(sent);
        }

        let next = [self.client.next_timeout(), self.server.next_timeout()]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or(self.now + Duration::from_secs(1));
        self.now = next.max(self.now + Duration::from_millis(1));
        self.client.handle_timeout(self.now)?;
        self.server.handle_timeout(self.now);
        Ok(0)
    }

    /// Step until `done` holds, failing the test after `max_steps`
    pub fn run_until(&mut self, max_steps: usize, mut done: impl FnMut(&mut Self) -> bool) -> Result<(), TunnelError> {
        for _ in 0..max_steps {
            if done(self) {
                return Ok(());
            }
            self.step()?;
        }
        panic!("condition not reached after {} steps", max_steps);
    }

    pub fn establish(&mut self) {
        self.run_until(200, |h| h.client.state() == SessionState::Established)
            .unwrap();
    }

    pub fn session(&self) -> u8 {
        self.client.session_id().unwrap()
    }
}

/// Minimal IPv4 packet from `src` with `len` total bytes
pub fn ipv4_packet(src: [u8; 4], dst: [u8; 4], len: usize) -> Vec<u8> {
    let mut packet: Vec<u8> = (0..len).map(|i| (i * 31 % 251) as u8).collect();
    packet[0] = 0x45;
    packet[12..16].copy_from_slice(&src);
    packet[16..20].copy_from_slice(&dst);
    packet
}
