//! Query/reply framing
//!
//! Upstream (client -> server) a frame is a query name:
//!
//! ```text
//! <24 base32 header chars><payload symbols>.<topdomain>
//! ```
//!
//! split into labels of at most 63 bytes. The header always uses base32 so the
//! server can read it, and learn the payload codec, whatever the session has
//! negotiated. Downstream (server -> client) the 15 header bytes and the
//! payload are encoded together with the reply codec and placed in the record
//! data of the queried type.
//!
//! Header layout (15 bytes, big endian):
//!
//! ```text
//! kind:1 session:1 seq:2 packet:2 index:1 count:1 ack:2 flags:1 codecs:1 nonce:2 backlog:1
//! ```

use crate::codec::Codec;
use crate::common::{Topdomain, MAX_LABEL_LEN};
use crate::dns::{self, DnsMessage, DnsRecord, Labels, RecordType, MAX_NAME_WIRE_LEN};
use crate::fragment::Fragment;
use crate::TunnelError;
use bytes::{Buf, BufMut};

/// Binary header size
pub const FRAME_HEADER_LEN: usize = 15;

/// Base32 symbols the header occupies in a query name
pub const FRAME_HEADER_CHARS: usize = 24;

/// Answer record overhead: compressed name pointer + type/class/ttl/rdlength
const ANSWER_OVERHEAD: usize = 12;

/// Worst-case echoed question: longest name + qtype + qclass
const WORST_QUESTION_LEN: usize = MAX_NAME_WIRE_LEN + 4;

pub const FLAG_FINAL: u8 = 0x01;
pub const FLAG_ACK: u8 = 0x02;
pub const FLAG_MORE: u8 = 0x04;

/// Session identifier; 0 means "no session yet"
pub type SessionId = u8;

/// Frame kinds. Replies reuse the kind of the query they answer, except
/// `Error`, and `Data`/`Poll` which tell whether a fragment is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Hello,
    CodecProbe,
    RecordProbe,
    FragProbe,
    Options,
    AuthRequest,
    AuthResponse,
    Data,
    Poll,
    Close,
    Error,
}

impl FrameKind {
    pub fn code(self) -> u8 {
        match self {
            FrameKind::Hello => 1,
            FrameKind::CodecProbe => 2,
            FrameKind::RecordProbe => 3,
            FrameKind::FragProbe => 4,
            FrameKind::Options => 5,
            FrameKind::AuthRequest => 6,
            FrameKind::AuthResponse => 7,
            FrameKind::Data => 8,
            FrameKind::Poll => 9,
            FrameKind::Close => 10,
            FrameKind::Error => 15,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => FrameKind::Hello,
            2 => FrameKind::CodecProbe,
            3 => FrameKind::RecordProbe,
            4 => FrameKind::FragProbe,
            5 => FrameKind::Options,
            6 => FrameKind::AuthRequest,
            7 => FrameKind::AuthResponse,
            8 => FrameKind::Data,
            9 => FrameKind::Poll,
            10 => FrameKind::Close,
            15 => FrameKind::Error,
            _ => return None,
        })
    }
}

/// Error codes carried in the payload of `FrameKind::Error` replies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    BadVersion,
    ServerFull,
    UnknownSession,
    BadPayload,
    BadOptions,
    AuthFailed,
    AuthExhausted,
    BadState,
    TooLarge,
}

impl ErrorCode {
    pub fn code(self) -> u8 {
        match self {
            ErrorCode::BadVersion => 1,
            ErrorCode::ServerFull => 2,
            ErrorCode::UnknownSession => 3,
            ErrorCode::BadPayload => 4,
            ErrorCode::BadOptions => 5,
            ErrorCode::AuthFailed => 6,
            ErrorCode::AuthExhausted => 7,
            ErrorCode::BadState => 8,
            ErrorCode::TooLarge => 9,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => ErrorCode::BadVersion,
            2 => ErrorCode::ServerFull,
            3 => ErrorCode::UnknownSession,
            4 => ErrorCode::BadPayload,
            5 => ErrorCode::BadOptions,
            6 => ErrorCode::AuthFailed,
            7 => ErrorCode::AuthExhausted,
            8 => ErrorCode::BadState,
            9 => ErrorCode::TooLarge,
            _ => return None,
        })
    }
}

/// Tunnel frame header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub session: SessionId,
    /// Fragment sequence number in this direction
    pub seq: u16,
    /// Parent packet id
    pub packet: u16,
    pub index: u8,
    pub count: u8,
    /// Highest contiguous sequence received from the peer (valid with FLAG_ACK)
    pub ack: u16,
    pub flags: u8,
    /// Codec of the query payload
    pub payload_codec: Codec,
    /// Codec the reply must be encoded with
    pub reply_codec: Codec,
    /// Cache buster
    pub nonce: u16,
    /// Fragments waiting on the server side, saturating
    pub backlog: u8,
}

impl FrameHeader {
    pub fn new(kind: FrameKind, session: SessionId) -> Self {
        Self {
            kind,
            session,
            seq: 0,
            packet: 0,
            index: 0,
            count: 0,
            ack: 0,
            flags: 0,
            payload_codec: Codec::Base32,
            reply_codec: Codec::Base32,
            nonce: 0,
            backlog: 0,
        }
    }

    /// Header describing `fragment`
    pub fn for_fragment(session: SessionId, fragment: &Fragment) -> Self {
        let mut header = Self::new(FrameKind::Data, session);
        header.seq = fragment.seq;
        header.packet = fragment.packet;
        header.index = fragment.index;
        header.count = fragment.count;
        if fragment.is_final() {
            header.flags |= FLAG_FINAL;
        }
        header
    }

    pub fn with_codecs(mut self, payload: Codec, reply: Codec) -> Self {
        self.payload_codec = payload;
        self.reply_codec = reply;
        self
    }

    pub fn with_ack(mut self, ack: Option<u16>) -> Self {
        match ack {
            Some(seq) => {
                self.ack = seq;
                self.flags |= FLAG_ACK;
            }
            None => {
                self.ack = 0;
                self.flags &= !FLAG_ACK;
            }
        }
        self
    }

    pub fn ack(&self) -> Option<u16> {
        (self.flags & FLAG_ACK != 0).then_some(self.ack)
    }

    pub fn is_final(&self) -> bool {
        self.flags & FLAG_FINAL != 0
    }

    pub fn more_pending(&self) -> bool {
        self.flags & FLAG_MORE != 0
    }

    pub fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut buf = [0u8; FRAME_HEADER_LEN];
        let mut out = &mut buf[..];
        out.put_u8(self.kind.code());
        out.put_u8(self.session);
        out.put_u16(self.seq);
        out.put_u16(self.packet);
        out.put_u8(self.index);
        out.put_u8(self.count);
        out.put_u16(self.ack);
        out.put_u8(self.flags);
        out.put_u8((self.payload_codec.id() << 4) | self.reply_codec.id());
        out.put_u16(self.nonce);
        out.put_u8(self.backlog);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, TunnelError> {
        if data.len() < FRAME_HEADER_LEN {
            return Err(TunnelError::Framing(format!(
                "frame header needs {} bytes, got {}",
                FRAME_HEADER_LEN,
                data.len()
            )));
        }
        let mut buf = &data[..FRAME_HEADER_LEN];

        let kind_code = buf.get_u8();
        let kind = FrameKind::from_code(kind_code)
            .ok_or_else(|| TunnelError::Framing(format!("unknown frame kind {}", kind_code)))?;
        let session = buf.get_u8();
        let seq = buf.get_u16();
        let packet = buf.get_u16();
        let index = buf.get_u8();
        let count = buf.get_u8();
        let ack = buf.get_u16();
        let flags = buf.get_u8();
        let codecs = buf.get_u8();
        let payload_codec = Codec::from_id(codecs >> 4)
            .ok_or_else(|| TunnelError::Framing(format!("unknown payload codec {}", codecs >> 4)))?;
        let reply_codec = Codec::from_id(codecs & 0x0f)
            .ok_or_else(|| TunnelError::Framing(format!("unknown reply codec {}", codecs & 0x0f)))?;
        let nonce = buf.get_u16();
        let backlog = buf.get_u8();

        if kind == FrameKind::Data {
            if count == 0 {
                return Err(TunnelError::Framing("fragment count is zero".into()));
            }
            if index >= count {
                return Err(TunnelError::Framing(format!(
                    "fragment index {} out of range for count {}",
                    index, count
                )));
            }
        }

        Ok(Self {
            kind,
            session,
            seq,
            packet,
            index,
            count,
            ack,
            flags,
            payload_codec,
            reply_codec,
            nonce,
            backlog,
        })
    }

    /// Fragment carried by a `Data` frame
    pub fn to_fragment(&self, data: Vec<u8>) -> Fragment {
        Fragment {
            seq: self.seq,
            packet: self.packet,
            index: self.index,
            count: self.count,
            data,
        }
    }
}

/// A decoded upstream frame
#[derive(Debug, Clone)]
pub struct QueryFrame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
    pub record_type: RecordType,
    /// EDNS0 payload size advertised by the resolver, if any
    pub edns: Option<u16>,
}

/// A decoded downstream frame
#[derive(Debug, Clone)]
pub struct ReplyFrame {
    /// DNS transaction id of the answer
    pub id: u16,
    pub header: FrameHeader,
    pub payload: Vec<u8>,
}

/// Symbols that fit in `avail` wire bytes of labels (63 symbols + 1 length
/// byte per full label)
fn label_symbols(avail: usize) -> usize {
    let per_label = MAX_LABEL_LEN + 1;
    (avail / per_label) * MAX_LABEL_LEN + (avail % per_label).saturating_sub(1)
}

/// Stateless frame encoder/decoder bound to one topdomain
#[derive(Debug, Clone)]
pub struct Framer {
    topdomain: Topdomain,
}

impl Framer {
    pub fn new(topdomain: Topdomain) -> Self {
        Self { topdomain }
    }

    pub fn topdomain(&self) -> &Topdomain {
        &self.topdomain
    }

    /// Whether `qname` lies under our topdomain and carries data labels
    pub fn is_tunnel_name(&self, qname: &[Vec<u8>]) -> bool {
        self.topdomain.strip_from(qname).is_some()
    }

    /// Symbols available for header + payload in a query name
    pub fn query_symbols(&self) -> usize {
        label_symbols(MAX_NAME_WIRE_LEN - self.topdomain.wire_len())
    }

    /// Largest upstream payload (bytes) a single query can carry with `codec`
    pub fn upstream_capacity(&self, codec: Codec) -> usize {
        if !codec.is_label_safe() {
            return 0;
        }
        let symbols = self.query_symbols().saturating_sub(FRAME_HEADER_CHARS);
        codec.max_decoded_len(symbols)
    }

    /// Largest downstream payload (bytes) that fits in one `record_type`
    /// answer encoded with `codec`, for any query name, within a DNS message
    /// of at most `limit` bytes.
    pub fn downstream_capacity(&self, record_type: RecordType, codec: Codec, limit: usize) -> usize {
        if !record_type.is_binary_safe() && !codec.is_label_safe() {
            return 0;
        }
        let limit = limit.min(usize::from(u16::MAX));
        let rdata = limit.saturating_sub(dns::HEADER_LEN + WORST_QUESTION_LEN + ANSWER_OVERHEAD);

        let symbols = match record_type {
            RecordType::Null | RecordType::Private => rdata,
            RecordType::Txt => {
                let per_string = 256;
                (rdata / per_string) * 255 + (rdata % per_string).saturating_sub(1)
            }
            RecordType::Cname | RecordType::Mx | RecordType::Srv => {
                let name = rdata
                    .saturating_sub(record_type.hostname_prefix_len())
                    .min(MAX_NAME_WIRE_LEN);
                label_symbols(name.saturating_sub(self.topdomain.wire_len()))
            }
        };
        codec.max_decoded_len(symbols).saturating_sub(FRAME_HEADER_LEN)
    }

    fn data_labels(&self, text: &[u8]) -> Labels {
        text.chunks(MAX_LABEL_LEN)
            .map(<[u8]>::to_vec)
            .chain(self.topdomain.labels().map(<[u8]>::to_vec))
            .collect()
    }

    /// Build a complete DNS query carrying `header` and `payload`
    pub fn encode_query(
        &self,
        header: &FrameHeader,
        payload: &[u8],
        record_type: RecordType,
        id: u16,
        edns: Option<u16>,
    ) -> Result<Vec<u8>, TunnelError> {
        let codec = header.payload_codec;
        if !codec.is_label_safe() {
            return Err(TunnelError::Framing(format!("{} cannot be used in a query name", codec)));
        }
        let max = self.upstream_capacity(codec);
        if payload.len() > max {
            return Err(TunnelError::PacketTooLarge {
                size: payload.len(),
                max,
            });
        }

        let mut text = Codec::Base32.encode(&header.encode());
        text.extend_from_slice(&codec.encode(payload));

        let qname = self.data_labels(&text);
        Ok(DnsMessage::new_query(id, qname, record_type.code(), edns).to_bytes())
    }

    /// Decode the tunnel frame carried by a parsed query
    pub fn decode_query(&self, msg: &DnsMessage) -> Result<QueryFrame, TunnelError> {
        let question = msg.question()?;
        let data_labels = self
            .topdomain
            .strip_from(&question.qname)
            .ok_or_else(|| TunnelError::Framing("query outside the topdomain".into()))?;

        let text: Vec<u8> = question.qname[..data_labels].concat();
        if text.len() < FRAME_HEADER_CHARS {
            return Err(TunnelError::Framing(format!("query name too short: {} symbols", text.len())));
        }

        let header = FrameHeader::decode(&Codec::Base32.decode(&text[..FRAME_HEADER_CHARS])?)?;
        if !header.payload_codec.is_label_safe() {
            return Err(TunnelError::Framing("raw payload in a query name".into()));
        }
        let payload = header.payload_codec.decode(&text[FRAME_HEADER_CHARS..])?;
        let record_type = RecordType::from_code(question.qtype)
            .ok_or_else(|| TunnelError::Framing(format!("unsupported query type {}", question.qtype)))?;

        Ok(QueryFrame {
            header,
            payload,
            record_type,
            edns: msg.edns_payload_size(),
        })
    }

    /// Build the answer to `query`, carrying `header` and `payload` in a
    /// `record_type` record encoded with the header's reply codec. Fails when
    /// the result would not fit in `limit` bytes.
    pub fn encode_reply(
        &self,
        query: &DnsMessage,
        record_type: RecordType,
        header: &FrameHeader,
        payload: &[u8],
        limit: usize,
    ) -> Result<Vec<u8>, TunnelError> {
        let codec = header.reply_codec;
        if !record_type.is_binary_safe() && !codec.is_label_safe() {
            return Err(TunnelError::Framing(format!("{} cannot be carried in {}", codec, record_type)));
        }
        let qname = query.question()?.qname.clone();

        let mut body = header.encode().to_vec();
        body.extend_from_slice(payload);
        let text = codec.encode(&body);

        let rdata = match record_type {
            RecordType::Null | RecordType::Private => text,
            RecordType::Txt => dns::txt_from_bytes(&text),
            RecordType::Cname | RecordType::Mx | RecordType::Srv => {
                let host = self.data_labels(&text);
                if dns::name_wire_len(&host) > MAX_NAME_WIRE_LEN {
                    return Err(TunnelError::PacketTooLarge {
                        size: payload.len(),
                        max: self.downstream_capacity(record_type, codec, limit),
                    });
                }
                let mut rdata = match record_type {
                    RecordType::Mx => 10u16.to_be_bytes().to_vec(),
                    // priority, weight, port
                    RecordType::Srv => vec![0, 0, 0, 0, 0, 53],
                    _ => Vec::new(),
                };
                rdata.extend_from_slice(&dns::name_to_wire(&host));
                rdata
            }
        };

        let answer = DnsRecord::new(qname, record_type.code(), rdata);
        let bytes = DnsMessage::response_to(query, vec![answer]).to_bytes();
        if bytes.len() > limit {
            return Err(TunnelError::PacketTooLarge {
                size: payload.len(),
                max: self.downstream_capacity(record_type, codec, limit),
            });
        }
        Ok(bytes)
    }

    /// Decode the tunnel frame carried by a response to a `record_type`
    /// query whose reply was requested with `codec`.
    pub fn decode_reply(&self, data: &[u8], record_type: RecordType, codec: Codec) -> Result<ReplyFrame, TunnelError> {
        let msg = DnsMessage::parse(data)?;
        if !msg.header.is_response() {
            return Err(TunnelError::Framing("expected a response".into()));
        }
        if msg.header.rcode() != dns::RCODE_NOERROR {
            return Err(TunnelError::Framing(format!("response rcode {}", msg.header.rcode())));
        }

        let answer = msg
            .answers
            .iter()
            .find(|a| a.rtype == record_type.code())
            .ok_or_else(|| TunnelError::Framing(format!("no {} answer", record_type)))?;

        let text = match record_type {
            RecordType::Null | RecordType::Private => answer.rdata.clone(),
            RecordType::Txt => dns::txt_to_bytes(&answer.rdata)?,
            RecordType::Cname | RecordType::Mx | RecordType::Srv => {
                let prefix = record_type.hostname_prefix_len();
                if answer.rdata.len() < prefix {
                    return Err(TunnelError::Framing("hostname record too short".into()));
                }
                let host = dns::name_from_wire(&answer.rdata[prefix..])?;
                let data_labels = self
                    .topdomain
                    .strip_from(&host)
                    .ok_or_else(|| TunnelError::Framing("answer outside the topdomain".into()))?;
                host[..data_labels].concat()
            }
        };

        let body = codec.decode(&text)?;
        let header = FrameHeader::decode(&body)?;
        Ok(ReplyFrame {
            id: msg.header.id,
            header,
            payload: body[FRAME_HEADER_LEN..].to_vec(),
        })
    }
}
