//! dnstun: IP over DNS
//!
//! dnstun carries IP packets inside DNS queries and answers, so a client can
//! reach a server through networks that only let DNS resolution out. The
//! client talks to its ordinary recursive resolver; the server is the
//! authoritative name server for a delegated domain (the *topdomain*).
//!
//! ## Features
//!
//! - **Codec negotiation**: base32, base64, base64u and base128 query names,
//!   densest first, each probed end to end through the resolver path
//! - **Downstream negotiation**: NULL, PRIVATE, TXT, SRV, MX and CNAME answers
//!   with raw, base128, base64 or base32 record data, and a probed fragment size
//! - **Fragmentation**: packets split to the negotiated capacity and
//!   reassembled exactly once on the far side
//! - **Windowed delivery**: cumulative acknowledgements piggybacked on every
//!   query, retransmission with RTT-based timeouts, adaptive polling
//! - **Login**: HMAC-SHA256 challenge/response over a shared password
//!
//! ## Quick Start
//!
//! The engines do no I/O. Drive them with your own sockets or use
//! [`transport`]:
//!
//! ```rust,no_run
//! use dnstun::{ClientEngine, TunnelConfig};
//! use std::time::Instant;
//!
//! # fn main() -> Result<(), dnstun::TunnelError> {
//! let config = TunnelConfig::new("t.example.com", "secret");
//! let mut client = ClientEngine::new(config, Instant::now())?;
//!
//! while let Some(query) = client.poll_query(Instant::now())? {
//!     // send `query` to the resolver, feed the answer back
//!     # let answer: Vec<u8> = query;
//!     client.handle_response(&answer, Instant::now())?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ### As a Command-Line Tool
//!
//! ```bash
//! # Server, authoritative for t.example.com
//! dnstun --topdomain t.example.com server --listen 0.0.0.0 --port 53 --bridge 127.0.0.1:5300
//!
//! # Client, through the system resolver
//! dnstun --topdomain t.example.com client --resolver 192.168.1.1 --bridge 127.0.0.1:5301
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐ packets ┌──────────────┐  DNS   ┌──────────┐  DNS   ┌──────────────┐ packets ┌──────────┐
//! │  bridge  │────────▶│ ClientEngine │───────▶│ resolver │───────▶│ ServerEngine │────────▶│  bridge  │
//! └──────────┘◀────────└──────────────┘◀───────└──────────┘◀───────└──────────────┘◀────────└──────────┘
//!                       fragment/window         queries and          session table
//!                       codec/framer            answers only         per-session windows
//! ```

pub mod auth;
pub mod client;
pub mod codec;
pub mod common;
pub mod config;
pub mod dns;
pub mod fragment;
pub mod frame;
pub mod server;
pub mod session;
pub mod transport;
pub mod window;

pub use client::ClientEngine;
pub use codec::Codec;
pub use common::{check_topdomain, format_addr, get_addr, AddrFamily, AddrFlags, Topdomain};
pub use config::{LimitsConfig, TimingConfig, TunnelConfig};
pub use dns::RecordType;
pub use fragment::{fragment_packet, Fragment, Reassembler};
pub use frame::{FrameHeader, FrameKind, Framer, SessionId};
pub use server::ServerEngine;
pub use session::{Negotiated, SessionState};

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, TunnelError>;

/// dnstun error types
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// Invalid topdomain or configuration value
    #[error("Invalid configuration: {0}")]
    Validation(String),

    /// Host name or address could not be resolved
    #[error("Address resolution failed: {0}")]
    Resolution(String),

    /// Text that is not valid for its codec
    #[error("Decode error: {0}")]
    Decode(String),

    /// DNS message or tunnel frame that does not parse
    #[error("Framing error: {0}")]
    Framing(String),

    /// The resolver path cannot carry any candidate encoding
    #[error("Capability negotiation failed: {0}")]
    Capability(String),

    /// Login rejected
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Peer broke the protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Peer stopped answering
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Packet too large for the tunnel
    #[error("Packet of {size} bytes exceeds the limit of {max}")]
    PacketTooLarge { size: usize, max: usize },

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    /// Errors that only spoil the frame at hand; the session carries on
    pub fn is_frame_local(&self) -> bool {
        matches!(
            self,
            TunnelError::Decode(_) | TunnelError::Framing(_) | TunnelError::PacketTooLarge { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_local_errors() {
        assert!(TunnelError::Decode("x".into()).is_frame_local());
        assert!(TunnelError::Framing("x".into()).is_frame_local());
        assert!(!TunnelError::Protocol("x".into()).is_frame_local());
        assert!(!TunnelError::Timeout("x".into()).is_frame_local());
    }

    #[test]
    fn test_error_display() {
        let err = TunnelError::PacketTooLarge { size: 70000, max: 51000 };
        assert_eq!(err.to_string(), "Packet of 70000 bytes exceeds the limit of 51000");
    }
}
