//! Byte <-> DNS-safe text codecs
//!
//! Every codec maps arbitrary bytes to symbols that survive a particular kind
//! of DNS carrier:
//!
//! - **Base32** (`a-z0-5`): survives resolvers that fold case, decodes
//!   case-insensitively. The conservative default.
//! - **Base64 / Base64u**: mixed-case alphabets, 6 bits per symbol. Only usable
//!   when the resolver chain preserves case.
//! - **Base128**: alphanumerics plus the octets `0xBC..=0xFD`, 7 bits per
//!   symbol. Needs a chain that passes 8-bit label bytes untouched.
//! - **Raw**: identity. Only for record data that carries arbitrary octets
//!   (NULL, PRIVATE, TXT).
//!
//! None of the text codecs use padding. A decode fails on an unknown symbol, on
//! a length no byte count encodes to, or on non-zero trailing bits.

use crate::TunnelError;
use data_encoding::{Encoding, Specification};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

const BASE32_SYMBOLS: &str = "abcdefghijklmnopqrstuvwxyz012345";
const BASE64_SYMBOLS: &str = "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ-0123456789+";
const BASE64U_SYMBOLS: &str = "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ_0123456789-";
const BASE128_ASCII: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const BASE128_HIGH_FIRST: u8 = 0xbc;

/// Payload codec, identified on the wire by a 4-bit id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    Raw,
    Base32,
    Base64,
    Base64u,
    Base128,
}

impl Codec {
    /// Text codecs usable in query names, densest first
    pub const UPSTREAM: [Codec; 4] = [Codec::Base128, Codec::Base64, Codec::Base64u, Codec::Base32];

    pub fn id(self) -> u8 {
        match self {
            Codec::Raw => 0,
            Codec::Base32 => 1,
            Codec::Base64 => 2,
            Codec::Base64u => 3,
            Codec::Base128 => 4,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Codec::Raw),
            1 => Some(Codec::Base32),
            2 => Some(Codec::Base64),
            3 => Some(Codec::Base64u),
            4 => Some(Codec::Base128),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Codec::Raw => "raw",
            Codec::Base32 => "base32",
            Codec::Base64 => "base64",
            Codec::Base64u => "base64u",
            Codec::Base128 => "base128",
        }
    }

    pub fn bits_per_symbol(self) -> usize {
        match self {
            Codec::Raw => 8,
            Codec::Base32 => 5,
            Codec::Base64 | Codec::Base64u => 6,
            Codec::Base128 => 7,
        }
    }

    /// Symbols may appear in a DNS label
    pub fn is_label_safe(self) -> bool {
        self != Codec::Raw
    }

    pub fn is_case_insensitive(self) -> bool {
        self == Codec::Base32
    }

    /// Number of symbols `len` bytes encode to
    pub fn encoded_len(self, len: usize) -> usize {
        (len * 8 + self.bits_per_symbol() - 1) / self.bits_per_symbol()
    }

    /// Largest byte count whose encoding fits in `symbols` symbols
    pub fn max_decoded_len(self, symbols: usize) -> usize {
        symbols * self.bits_per_symbol() / 8
    }

    pub fn encode(self, data: &[u8]) -> Vec<u8> {
        match self {
            Codec::Raw => data.to_vec(),
            Codec::Base128 => encode_base128(data),
            _ => self.text_encoding().encode(data).into_bytes(),
        }
    }

    pub fn decode(self, text: &[u8]) -> Result<Vec<u8>, TunnelError> {
        match self {
            Codec::Raw => Ok(text.to_vec()),
            Codec::Base128 => decode_base128(text),
            _ => self
                .text_encoding()
                .decode(text)
                .map_err(|e| TunnelError::Decode(format!("{}: {}", self, e))),
        }
    }

    /// Bytes whose encoding walks the alphabet in order, at most `max_bytes`
    /// long. Used to check that every symbol survives the resolver chain.
    pub fn probe_pattern(self, max_bytes: usize) -> Result<Vec<u8>, TunnelError> {
        let (block_bytes, alphabet): (usize, &[u8]) = match self {
            Codec::Raw => return Ok((0..max_bytes.min(256)).map(|i| i as u8).collect()),
            Codec::Base32 => (5, BASE32_SYMBOLS.as_bytes()),
            Codec::Base64 => (3, BASE64_SYMBOLS.as_bytes()),
            Codec::Base64u => (3, BASE64U_SYMBOLS.as_bytes()),
            Codec::Base128 => (7, base128_symbols()),
        };
        let full = alphabet.len() * self.bits_per_symbol() / 8;
        let len = max_bytes.min(full) / block_bytes * block_bytes;
        let text: Vec<u8> = alphabet
            .iter()
            .cycle()
            .take(self.encoded_len(len))
            .copied()
            .collect();
        self.decode(&text)
    }

    fn text_encoding(self) -> &'static Encoding {
        static BASE32: OnceLock<Encoding> = OnceLock::new();
        static BASE64: OnceLock<Encoding> = OnceLock::new();
        static BASE64U: OnceLock<Encoding> = OnceLock::new();

        match self {
            Codec::Base64 => BASE64.get_or_init(|| build_encoding(BASE64_SYMBOLS, false)),
            Codec::Base64u => BASE64U.get_or_init(|| build_encoding(BASE64U_SYMBOLS, false)),
            _ => BASE32.get_or_init(|| build_encoding(BASE32_SYMBOLS, true)),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Codec {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raw" => Ok(Codec::Raw),
            "base32" => Ok(Codec::Base32),
            "base64" => Ok(Codec::Base64),
            "base64u" => Ok(Codec::Base64u),
            "base128" => Ok(Codec::Base128),
            other => Err(TunnelError::Validation(format!("unknown codec: {}", other))),
        }
    }
}

fn build_encoding(symbols: &str, fold_case: bool) -> Encoding {
    let mut spec = Specification::new();
    spec.symbols.push_str(symbols);
    if fold_case {
        let upper = symbols.to_ascii_uppercase();
        for (from, to) in upper.chars().zip(symbols.chars()) {
            if from != to {
                spec.translate.from.push(from);
                spec.translate.to.push(to);
            }
        }
    }
    // constant alphabets with unique symbols
    spec.encoding().expect("codec alphabet has unique symbols")
}

fn base128_symbols() -> &'static [u8] {
    static SYMBOLS: OnceLock<Vec<u8>> = OnceLock::new();
    SYMBOLS.get_or_init(|| {
        let mut symbols = BASE128_ASCII.to_vec();
        symbols.extend(BASE128_HIGH_FIRST..=0xfd);
        symbols
    })
}

fn base128_reverse() -> &'static [u8; 256] {
    static REVERSE: OnceLock<[u8; 256]> = OnceLock::new();
    REVERSE.get_or_init(|| {
        let mut table = [0xff; 256];
        for (value, &symbol) in base128_symbols().iter().enumerate() {
            table[symbol as usize] = value as u8;
        }
        table
    })
}

fn encode_base128(data: &[u8]) -> Vec<u8> {
    let symbols = base128_symbols();
    let mut out = Vec::with_capacity(Codec::Base128.encoded_len(data.len()));
    let mut acc: u32 = 0;
    let mut bits = 0;

    for &byte in data {
        acc = (acc << 8) | u32::from(byte);
        bits += 8;
        while bits >= 7 {
            bits -= 7;
            out.push(symbols[((acc >> bits) & 0x7f) as usize]);
        }
        acc &= (1 << bits) - 1;
    }
    if bits > 0 {
        out.push(symbols[((acc << (7 - bits)) & 0x7f) as usize]);
    }
    out
}

fn decode_base128(text: &[u8]) -> Result<Vec<u8>, TunnelError> {
    let len = Codec::Base128.max_decoded_len(text.len());
    if Codec::Base128.encoded_len(len) != text.len() {
        return Err(TunnelError::Decode(format!(
            "base128: invalid length {}",
            text.len()
        )));
    }

    let reverse = base128_reverse();
    let mut out = Vec::with_capacity(len);
    let mut acc: u32 = 0;
    let mut bits = 0;

    for (pos, &symbol) in text.iter().enumerate() {
        let value = reverse[symbol as usize];
        if value == 0xff {
            return Err(TunnelError::Decode(format!(
                "base128: invalid symbol 0x{:02x} at {}",
                symbol, pos
            )));
        }
        acc = (acc << 7) | u32::from(value);
        bits += 7;
        if bits >= 8 {
            bits -= 8;
            out.push((acc >> bits) as u8);
        }
        acc &= (1 << bits) - 1;
    }
    if acc != 0 {
        return Err(TunnelError::Decode("base128: non-zero trailing bits".into()));
    }
    Ok(out)
}
