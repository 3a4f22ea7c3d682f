// Minimal DNS protocol implementation for the tunnel
//
// Implements just enough of the DNS protocol to:
// - Build and parse queries carrying one question (plus an optional EDNS0 OPT)
// - Build and parse responses carrying NULL/PRIVATE/TXT/CNAME/MX/SRV answers
// - Follow compression pointers that resolvers introduce on the way back
//
// Names are kept as raw octet labels; base128 payload labels are not UTF-8.

use crate::TunnelError;
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;
use std::str::FromStr;

/// Maximum DNS UDP message size without EDNS0 (RFC 1035)
pub const MAX_DNS_UDP_SIZE: usize = 512;

/// Maximum wire length of a domain name, including length bytes and root
pub const MAX_NAME_WIRE_LEN: usize = 255;

/// Fixed DNS header size
pub const HEADER_LEN: usize = 12;

pub const TYPE_OPT: u16 = 41;
pub const CLASS_IN: u16 = 1;

pub const RCODE_NOERROR: u8 = 0;
pub const RCODE_REFUSED: u8 = 5;

/// Limit on compression pointer hops while reading a name
const MAX_POINTER_HOPS: usize = 16;

/// A domain name as a list of raw labels
pub type Labels = Vec<Vec<u8>>;

/// Record types that can carry downstream tunnel data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordType {
    Null,
    Private,
    Txt,
    Srv,
    Mx,
    Cname,
}

impl RecordType {
    /// Default probe order, roomiest carriers first
    pub const ALL: [RecordType; 6] = [
        RecordType::Null,
        RecordType::Private,
        RecordType::Txt,
        RecordType::Srv,
        RecordType::Mx,
        RecordType::Cname,
    ];

    pub fn code(self) -> u16 {
        match self {
            RecordType::Cname => 5,
            RecordType::Null => 10,
            RecordType::Mx => 15,
            RecordType::Txt => 16,
            RecordType::Srv => 33,
            RecordType::Private => 65399,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            5 => Some(RecordType::Cname),
            10 => Some(RecordType::Null),
            15 => Some(RecordType::Mx),
            16 => Some(RecordType::Txt),
            33 => Some(RecordType::Srv),
            65399 => Some(RecordType::Private),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecordType::Null => "null",
            RecordType::Private => "private",
            RecordType::Txt => "txt",
            RecordType::Srv => "srv",
            RecordType::Mx => "mx",
            RecordType::Cname => "cname",
        }
    }

    /// Record data is an arbitrary octet string (no hostname structure)
    pub fn is_binary_safe(self) -> bool {
        matches!(self, RecordType::Null | RecordType::Private | RecordType::Txt)
    }

    /// Fixed RDATA bytes in front of the hostname (MX preference, SRV
    /// priority/weight/port)
    pub fn hostname_prefix_len(self) -> usize {
        match self {
            RecordType::Mx => 2,
            RecordType::Srv => 6,
            _ => 0,
        }
    }

    /// Reply codecs to try for this record type, densest first
    pub fn reply_codecs(self) -> &'static [crate::Codec] {
        use crate::Codec;
        match self {
            RecordType::Null | RecordType::Private => &[Codec::Raw],
            RecordType::Txt => &[Codec::Raw, Codec::Base64, Codec::Base32],
            RecordType::Srv | RecordType::Mx | RecordType::Cname => &[Codec::Base128, Codec::Base32],
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordType {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RecordType::ALL
            .iter()
            .copied()
            .find(|rt| rt.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| TunnelError::Validation(format!("unknown record type: {}", s)))
    }
}

/// DNS message header (12 bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsHeader {
    pub id: u16,      // Transaction ID
    pub flags: u16,   // Flags
    pub qdcount: u16, // Question count
    pub ancount: u16, // Answer count
    pub nscount: u16, // Authority count
    pub arcount: u16, // Additional count
}

impl DnsHeader {
    /// Create a new query header
    pub fn new_query(id: u16) -> Self {
        Self {
            id,
            flags: 0x0100, // Standard query, recursion desired
            qdcount: 1,
            ancount: 0,
            nscount: 0,
            arcount: 0,
        }
    }

    /// Parse header from bytes
    pub fn parse(buf: &mut Cursor<&[u8]>) -> Result<Self, TunnelError> {
        if buf.remaining() < HEADER_LEN {
            return Err(TunnelError::Framing("DNS header too short".into()));
        }

        Ok(Self {
            id: buf.get_u16(),
            flags: buf.get_u16(),
            qdcount: buf.get_u16(),
            ancount: buf.get_u16(),
            nscount: buf.get_u16(),
            arcount: buf.get_u16(),
        })
    }

    /// Write header to buffer
    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u16(self.id);
        buf.put_u16(self.flags);
        buf.put_u16(self.qdcount);
        buf.put_u16(self.ancount);
        buf.put_u16(self.nscount);
        buf.put_u16(self.arcount);
    }

    /// Check if this is a response
    pub fn is_response(&self) -> bool {
        (self.flags & 0x8000) != 0
    }

    pub fn rcode(&self) -> u8 {
        (self.flags & 0x000f) as u8
    }
}

/// DNS question
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub qname: Labels,
    pub qtype: u16,
    pub qclass: u16,
}

impl DnsQuestion {
    pub fn new(qname: Labels, qtype: u16) -> Self {
        Self {
            qname,
            qtype,
            qclass: CLASS_IN,
        }
    }

    fn parse(data: &[u8], buf: &mut Cursor<&[u8]>) -> Result<Self, TunnelError> {
        let qname = read_name(data, buf)?;

        if buf.remaining() < 4 {
            return Err(TunnelError::Framing("question too short".into()));
        }

        Ok(Self {
            qname,
            qtype: buf.get_u16(),
            qclass: buf.get_u16(),
        })
    }

    fn write(&self, buf: &mut BytesMut) {
        write_name(&self.qname, buf);
        buf.put_u16(self.qtype);
        buf.put_u16(self.qclass);
    }

    /// Wire size of this question
    pub fn wire_len(&self) -> usize {
        name_wire_len(&self.qname) + 4
    }
}

/// DNS resource record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub name: Labels,
    pub rtype: u16,
    pub rclass: u16,
    pub ttl: u32,
    /// Record data. Hostnames inside CNAME/MX/SRV data are always stored
    /// uncompressed.
    pub rdata: Vec<u8>,
}

impl DnsRecord {
    pub fn new(name: Labels, rtype: u16, rdata: Vec<u8>) -> Self {
        Self {
            name,
            rtype,
            rclass: CLASS_IN,
            ttl: 0,
            rdata,
        }
    }

    /// EDNS0 pseudo-record advertising our UDP payload size
    pub fn opt(payload_size: u16) -> Self {
        Self {
            name: Vec::new(),
            rtype: TYPE_OPT,
            rclass: payload_size,
            ttl: 0,
            rdata: Vec::new(),
        }
    }

    fn parse(data: &[u8], buf: &mut Cursor<&[u8]>) -> Result<Self, TunnelError> {
        let name = read_name(data, buf)?;

        if buf.remaining() < 10 {
            return Err(TunnelError::Framing("record too short".into()));
        }

        let rtype = buf.get_u16();
        let rclass = buf.get_u16();
        let ttl = buf.get_u32();
        let rdlen = buf.get_u16() as usize;

        if buf.remaining() < rdlen {
            return Err(TunnelError::Framing("truncated record data".into()));
        }

        let start = buf.position() as usize;
        let rdata = match RecordType::from_code(rtype) {
            Some(rt) if !rt.is_binary_safe() => {
                let prefix = rt.hostname_prefix_len();
                if rdlen < prefix {
                    return Err(TunnelError::Framing("record data too short".into()));
                }
                let mut rdata = data[start..start + prefix].to_vec();
                let mut inner = Cursor::new(data);
                inner.set_position((start + prefix) as u64);
                let host = read_name(data, &mut inner)?;
                let mut host_buf = BytesMut::new();
                write_name(&host, &mut host_buf);
                rdata.extend_from_slice(&host_buf);
                rdata
            }
            _ => data[start..start + rdlen].to_vec(),
        };
        buf.advance(rdlen);

        Ok(Self {
            name,
            rtype,
            rclass,
            ttl,
            rdata,
        })
    }

    fn write(&self, buf: &mut BytesMut, first_qname: Option<&Labels>) {
        match first_qname {
            Some(qname) if *qname == self.name && !self.name.is_empty() => {
                buf.put_u16(0xc000 | HEADER_LEN as u16);
            }
            _ => write_name(&self.name, buf),
        }
        buf.put_u16(self.rtype);
        buf.put_u16(self.rclass);
        buf.put_u32(self.ttl);
        buf.put_u16(self.rdata.len() as u16);
        buf.put_slice(&self.rdata);
    }
}

/// DNS message (complete query or response)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsMessage {
    pub header: DnsHeader,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
    pub additionals: Vec<DnsRecord>,
}

impl DnsMessage {
    /// Create a query for `qname`, optionally advertising EDNS0 support
    pub fn new_query(id: u16, qname: Labels, qtype: u16, edns: Option<u16>) -> Self {
        let mut header = DnsHeader::new_query(id);
        let additionals: Vec<DnsRecord> = edns.map(DnsRecord::opt).into_iter().collect();
        header.arcount = additionals.len() as u16;
        Self {
            header,
            questions: vec![DnsQuestion::new(qname, qtype)],
            answers: Vec::new(),
            additionals,
        }
    }

    /// Authoritative response to `query` carrying `answers`
    pub fn response_to(query: &DnsMessage, answers: Vec<DnsRecord>) -> Self {
        Self::with_rcode(query, answers, RCODE_NOERROR)
    }

    /// REFUSED response for names we are not authoritative for
    pub fn refused(query: &DnsMessage) -> Self {
        Self::with_rcode(query, Vec::new(), RCODE_REFUSED)
    }

    fn with_rcode(query: &DnsMessage, answers: Vec<DnsRecord>, rcode: u8) -> Self {
        let flags = 0x8400 | (query.header.flags & 0x0100) | u16::from(rcode & 0x0f);
        Self {
            header: DnsHeader {
                id: query.header.id,
                flags,
                qdcount: query.questions.len() as u16,
                ancount: answers.len() as u16,
                nscount: 0,
                arcount: 0,
            },
            questions: query.questions.clone(),
            answers,
            additionals: Vec::new(),
        }
    }

    /// Parse DNS message from bytes
    pub fn parse(data: &[u8]) -> Result<Self, TunnelError> {
        let mut cursor = Cursor::new(data);

        let header = DnsHeader::parse(&mut cursor)?;

        let mut questions = Vec::new();
        for _ in 0..header.qdcount {
            questions.push(DnsQuestion::parse(data, &mut cursor)?);
        }

        let mut answers = Vec::new();
        for _ in 0..header.ancount {
            answers.push(DnsRecord::parse(data, &mut cursor)?);
        }

        // authority records carry nothing for us
        for _ in 0..header.nscount {
            DnsRecord::parse(data, &mut cursor)?;
        }

        let mut additionals = Vec::new();
        for _ in 0..header.arcount {
            additionals.push(DnsRecord::parse(data, &mut cursor)?);
        }

        Ok(Self {
            header,
            questions,
            answers,
            additionals,
        })
    }

    /// Serialize DNS message to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(MAX_DNS_UDP_SIZE);

        let mut header = self.header.clone();
        header.qdcount = self.questions.len() as u16;
        header.ancount = self.answers.len() as u16;
        header.nscount = 0;
        header.arcount = self.additionals.len() as u16;
        header.write(&mut buf);

        for q in &self.questions {
            q.write(&mut buf);
        }
        // answers about the first question point back at its name
        let first_qname = self.questions.first().map(|q| &q.qname);
        for a in &self.answers {
            a.write(&mut buf, first_qname);
        }
        for a in &self.additionals {
            a.write(&mut buf, None);
        }

        buf.to_vec()
    }

    /// The single question every tunnel message carries
    pub fn question(&self) -> Result<&DnsQuestion, TunnelError> {
        self.questions
            .first()
            .ok_or_else(|| TunnelError::Framing("no question in message".into()))
    }

    /// UDP payload size advertised through EDNS0, if any
    pub fn edns_payload_size(&self) -> Option<u16> {
        self.additionals
            .iter()
            .find(|r| r.rtype == TYPE_OPT)
            .map(|r| r.rclass)
    }
}

/// Wire length of a name: length byte + bytes per label, plus the root
pub fn name_wire_len(labels: &[Vec<u8>]) -> usize {
    labels.iter().map(|l| l.len() + 1).sum::<usize>() + 1
}

/// Read a domain name, following compression pointers
fn read_name(data: &[u8], buf: &mut Cursor<&[u8]>) -> Result<Labels, TunnelError> {
    let mut labels = Vec::new();
    let mut wire_len = 1;
    let mut hops = 0;
    // position to resume at after the first pointer
    let mut resume: Option<u64> = None;

    loop {
        if !buf.has_remaining() {
            return Err(TunnelError::Framing("truncated domain name".into()));
        }

        let len = buf.get_u8();

        if len == 0 {
            break;
        }

        if (len & 0xc0) == 0xc0 {
            if !buf.has_remaining() {
                return Err(TunnelError::Framing("truncated compression pointer".into()));
            }
            hops += 1;
            if hops > MAX_POINTER_HOPS {
                return Err(TunnelError::Framing("compression pointer loop".into()));
            }
            let offset = (u16::from(len & 0x3f) << 8) | u16::from(buf.get_u8());
            if resume.is_none() {
                resume = Some(buf.position());
            }
            if offset as usize >= data.len() {
                return Err(TunnelError::Framing("compression pointer out of range".into()));
            }
            buf.set_position(u64::from(offset));
            continue;
        }

        if len & 0xc0 != 0 {
            return Err(TunnelError::Framing("unsupported label type".into()));
        }

        let label_len = len as usize;
        if buf.remaining() < label_len {
            return Err(TunnelError::Framing("truncated label".into()));
        }
        wire_len += label_len + 1;
        if wire_len > MAX_NAME_WIRE_LEN {
            return Err(TunnelError::Framing("domain name longer than 255 bytes".into()));
        }

        let mut label = vec![0u8; label_len];
        buf.copy_to_slice(&mut label);
        labels.push(label);
    }

    if let Some(pos) = resume {
        buf.set_position(pos);
    }
    Ok(labels)
}

/// Write a domain name without compression
fn write_name(labels: &[Vec<u8>], buf: &mut BytesMut) {
    for label in labels {
        buf.put_u8(label.len() as u8);
        buf.put_slice(label);
    }
    buf.put_u8(0); // End of name
}

/// Encode a name into standalone wire bytes (used for hostname RDATA)
pub fn name_to_wire(labels: &[Vec<u8>]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(name_wire_len(labels));
    write_name(labels, &mut buf);
    buf.to_vec()
}

/// Decode an uncompressed wire name at the start of `data`
pub fn name_from_wire(data: &[u8]) -> Result<Labels, TunnelError> {
    let mut cursor = Cursor::new(data);
    read_name(data, &mut cursor)
}

/// Split `data` into TXT character-strings of at most 255 bytes
pub fn txt_from_bytes(data: &[u8]) -> Vec<u8> {
    let mut rdata = Vec::with_capacity(data.len() + data.len() / 255 + 1);
    if data.is_empty() {
        rdata.push(0);
    }
    for chunk in data.chunks(255) {
        rdata.push(chunk.len() as u8);
        rdata.extend_from_slice(chunk);
    }
    rdata
}

/// Concatenate the character-strings of TXT record data
pub fn txt_to_bytes(rdata: &[u8]) -> Result<Vec<u8>, TunnelError> {
    let mut result = Vec::with_capacity(rdata.len());
    let mut cursor = Cursor::new(rdata);

    while cursor.has_remaining() {
        let len = cursor.get_u8() as usize;

        if cursor.remaining() < len {
            return Err(TunnelError::Framing("truncated TXT data".into()));
        }

        let mut chunk = vec![0u8; len];
        cursor.copy_to_slice(&mut chunk);
        result.extend_from_slice(&chunk);
    }

    Ok(result)
}

/// Build labels from a dotted ASCII name (test and config helper)
pub fn labels_from_str(name: &str) -> Labels {
    name.split('.')
        .filter(|l| !l.is_empty())
        .map(|l| l.as_bytes().to_vec())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dns_query_construction() {
        let msg = DnsMessage::new_query(0x1234, labels_from_str("tunnel.example.com"), 16, None);
        let bytes = msg.to_bytes();

        assert!(bytes.len() > HEADER_LEN);
        assert_eq!(&bytes[0..2], &[0x12, 0x34]); // Transaction ID

        let parsed = DnsMessage::parse(&bytes).unwrap();
        assert_eq!(parsed, msg);
        assert!(!parsed.header.is_response());
        assert_eq!(parsed.edns_payload_size(), None);
    }

    #[test]
    fn test_edns_opt_roundtrip() {
        let msg = DnsMessage::new_query(7, labels_from_str("a.b"), 10, Some(1232));
        let parsed = DnsMessage::parse(&msg.to_bytes()).unwrap();
        assert_eq!(parsed.edns_payload_size(), Some(1232));
    }

    #[test]
    fn test_response_echoes_question() {
        let query = DnsMessage::new_query(0xbeef, labels_from_str("x.t.example.com"), 10, None);
        let answer = DnsRecord::new(query.questions[0].qname.clone(), 10, vec![1, 2, 3]);
        let response = DnsMessage::response_to(&query, vec![answer]);

        let parsed = DnsMessage::parse(&response.to_bytes()).unwrap();
        assert!(parsed.header.is_response());
        assert_eq!(parsed.header.id, 0xbeef);
        assert_eq!(parsed.header.rcode(), RCODE_NOERROR);
        assert_eq!(parsed.questions, query.questions);
        assert_eq!(parsed.answers[0].rdata, vec![1, 2, 3]);

        let refused = DnsMessage::parse(&DnsMessage::refused(&query).to_bytes()).unwrap();
        assert_eq!(refused.header.rcode(), RCODE_REFUSED);
        assert!(refused.answers.is_empty());
    }

    #[test]
    fn test_compressed_cname_is_expanded() {
        // query for a.b, answer CNAME whose target is "x" + pointer to "b"
        let mut packet = vec![0x00, 0x01, 0x84, 0x00, 0, 1, 0, 1, 0, 0, 0, 0];
        packet.extend_from_slice(&[1, b'a', 1, b'b', 0, 0, 5, 0, 1]);
        packet.extend_from_slice(&[0xc0, 12, 0, 5, 0, 1, 0, 0, 0, 0, 0, 4]);
        packet.extend_from_slice(&[1, b'x', 0xc0, 14]);

        let parsed = DnsMessage::parse(&packet).unwrap();
        assert_eq!(parsed.answers[0].name, labels_from_str("a.b"));
        assert_eq!(parsed.answers[0].rdata, name_to_wire(&labels_from_str("x.b")));
    }

    #[test]
    fn test_pointer_loop_rejected() {
        let mut packet = vec![0x00, 0x01, 0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0];
        packet.extend_from_slice(&[0xc0, 12, 0, 16, 0, 1]);
        assert!(DnsMessage::parse(&packet).is_err());
    }

    #[test]
    fn test_binary_labels_survive() {
        let qname = vec![vec![0xbc, 0xfd, b'a'], b"example".to_vec(), b"com".to_vec()];
        let msg = DnsMessage::new_query(1, qname.clone(), 10, None);
        let parsed = DnsMessage::parse(&msg.to_bytes()).unwrap();
        assert_eq!(parsed.questions[0].qname, qname);
        assert_eq!(name_wire_len(&qname), 17);
    }

    #[test]
    fn test_txt_record_data() {
        let data: Vec<u8> = (0..600u32).map(|i| i as u8).collect();
        let rdata = txt_from_bytes(&data);
        assert_eq!(rdata.len(), 603);
        assert_eq!(txt_to_bytes(&rdata).unwrap(), data);
        assert_eq!(txt_to_bytes(&txt_from_bytes(&[])).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_record_type_codes() {
        for rt in RecordType::ALL {
            assert_eq!(RecordType::from_code(rt.code()), Some(rt));
            assert_eq!(rt.as_str().parse::<RecordType>().unwrap(), rt);
        }
        assert_eq!(RecordType::Private.code(), 65399);
    }
}
