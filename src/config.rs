//! dnstun configuration

use crate::codec::Codec;
use crate::common::validate_topdomain;
use crate::dns::{RecordType, MAX_DNS_UDP_SIZE};
use crate::window::MAX_OUT_OF_ORDER;
use crate::TunnelError;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunnel configuration shared by client and server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Domain delegated to the tunnel server
    pub topdomain: String,

    /// Shared login password
    #[serde(default)]
    pub password: String,

    /// Upstream codecs to probe, densest first
    #[serde(default = "default_codecs")]
    pub codecs: Vec<Codec>,

    /// Downstream record types to probe, in order
    #[serde(default = "default_record_types")]
    pub record_types: Vec<RecordType>,

    /// EDNS0 UDP payload size to advertise (client) or accept (server).
    /// `None` disables EDNS0 and caps messages at 512 bytes.
    #[serde(default = "default_edns_payload_size")]
    pub edns_payload_size: Option<u16>,

    /// Upper bound on the downstream fragment size the client will probe
    #[serde(default)]
    pub max_fragment_size: Option<usize>,

    /// Upper bound on the upstream fragment size; the query name capacity
    /// of the chosen codec applies either way
    #[serde(default)]
    pub max_upstream_fragment_size: Option<usize>,

    #[serde(default)]
    pub timing: TimingConfig,

    #[serde(default)]
    pub limits: LimitsConfig,
}

fn default_codecs() -> Vec<Codec> {
    Codec::UPSTREAM.to_vec()
}

fn default_record_types() -> Vec<RecordType> {
    RecordType::ALL.to_vec()
}

fn default_edns_payload_size() -> Option<u16> {
    Some(1232)
}

/// Timers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Wait for a handshake reply before retrying
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,

    /// Wait for a single capability probe
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,

    /// Initial retransmit timeout before RTT samples exist
    #[serde(with = "humantime_serde")]
    pub retransmit_timeout: Duration,

    /// Silence after which a session is torn down
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,

    /// Longest gap between client polls
    #[serde(with = "humantime_serde")]
    pub keepalive_interval: Duration,

    /// Shortest gap between client polls
    #[serde(with = "humantime_serde")]
    pub min_poll_interval: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(2),
            retransmit_timeout: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(5),
            min_poll_interval: Duration::from_millis(50),
        }
    }
}

/// Resource caps
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Concurrent sessions on the server (at most 255)
    pub max_sessions: usize,

    /// Unacknowledged client -> server fragments
    pub upstream_window: usize,

    /// Unacknowledged server -> client fragments
    pub downstream_window: usize,

    /// Concurrent partial packets per reassembler
    pub max_runs: usize,

    /// Age after which a partial packet is dropped
    #[serde(with = "humantime_serde")]
    pub reassembly_timeout: Duration,

    /// Fragments queued per send window
    pub max_queued_fragments: usize,

    /// Login attempts before the session is closed
    pub max_auth_attempts: u32,

    /// Protocol errors before the server tears a session down
    pub max_protocol_violations: u32,

    /// Hello retransmissions before giving up
    pub handshake_retries: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_sessions: 16,
            upstream_window: 8,
            downstream_window: 8,
            max_runs: 16,
            reassembly_timeout: Duration::from_secs(10),
            max_queued_fragments: 512,
            max_auth_attempts: 3,
            max_protocol_violations: 8,
            handshake_retries: 3,
        }
    }
}

impl TunnelConfig {
    /// Configuration with defaults for everything but the topdomain and password
    pub fn new(topdomain: &str, password: &str) -> Self {
        Self {
            topdomain: topdomain.to_string(),
            password: password.to_string(),
            codecs: default_codecs(),
            record_types: default_record_types(),
            edns_payload_size: default_edns_payload_size(),
            max_fragment_size: None,
            max_upstream_fragment_size: None,
            timing: TimingConfig::default(),
            limits: LimitsConfig::default(),
        }
    }

    /// Load configuration from TOML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    /// Largest DNS message this side is willing to use
    pub fn message_limit(&self) -> usize {
        self.edns_payload_size
            .map_or(MAX_DNS_UDP_SIZE, |size| usize::from(size).max(MAX_DNS_UDP_SIZE))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), TunnelError> {
        let invalid = |msg: &str| Err(TunnelError::Validation(msg.to_string()));

        validate_topdomain(&self.topdomain)?;
        if self.password.is_empty() {
            return invalid("password must be set");
        }
        if self.codecs.is_empty() {
            return invalid("at least one upstream codec is required");
        }
        if let Some(codec) = self.codecs.iter().find(|c| !c.is_label_safe()) {
            return Err(TunnelError::Validation(format!(
                "codec {} cannot be used upstream",
                codec
            )));
        }
        if self.record_types.is_empty() {
            return invalid("at least one record type is required");
        }
        if matches!(self.edns_payload_size, Some(size) if usize::from(size) < MAX_DNS_UDP_SIZE) {
            return invalid("edns_payload_size must be at least 512");
        }
        if self.max_fragment_size == Some(0) || self.max_upstream_fragment_size == Some(0) {
            return invalid("fragment size limits must be positive");
        }

        let t = &self.timing;
        if [t.handshake_timeout, t.probe_timeout, t.retransmit_timeout, t.idle_timeout, t.min_poll_interval]
            .iter()
            .any(Duration::is_zero)
        {
            return invalid("timeouts must be positive");
        }
        if t.min_poll_interval > t.keepalive_interval {
            return invalid("min_poll_interval must not exceed keepalive_interval");
        }
        if t.keepalive_interval >= t.idle_timeout {
            return invalid("keepalive_interval must be shorter than idle_timeout");
        }

        let l = &self.limits;
        if l.max_sessions == 0 || l.max_sessions > usize::from(u8::MAX) {
            return invalid("max_sessions must be between 1 and 255");
        }
        let max_window = usize::from(MAX_OUT_OF_ORDER);
        if [l.upstream_window, l.downstream_window]
            .iter()
            .any(|&w| w == 0 || w > max_window)
        {
            return invalid("windows must be between 1 and 256");
        }
        if l.max_runs == 0 || l.max_queued_fragments == 0 {
            return invalid("max_runs and max_queued_fragments must be positive");
        }
        if l.max_auth_attempts == 0 || l.max_protocol_violations == 0 {
            return invalid("max_auth_attempts and max_protocol_violations must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TunnelConfig::new("t.example.com", "secret");
        assert!(config.validate().is_ok());
        assert_eq!(config.codecs[0], Codec::Base128);
        assert_eq!(config.message_limit(), 1232);
    }

    #[test]
    fn test_config_validation() {
        let mut config = TunnelConfig::new("t.example.com", "");
        assert!(config.validate().is_err());

        config.password = "secret".into();
        config.codecs = vec![Codec::Raw];
        assert!(config.validate().is_err());

        config.codecs = vec![Codec::Base32];
        config.limits.max_sessions = 256;
        assert!(config.validate().is_err());

        config.limits.max_sessions = 255;
        assert!(config.validate().is_ok());

        config.topdomain = "nodots".into();
        assert!(matches!(config.validate(), Err(TunnelError::Validation(_))));
    }

    #[test]
    fn test_window_limits() {
        let mut config = TunnelConfig::new("t.example.com", "secret");
        config.limits.upstream_window = 256;
        config.limits.downstream_window = 256;
        assert!(config.validate().is_ok());

        config.limits.downstream_window = 257;
        assert!(matches!(config.validate(), Err(TunnelError::Validation(_))));

        config.limits.downstream_window = 256;
        config.limits.upstream_window = 1000;
        assert!(config.validate().is_err());

        config.limits.upstream_window = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_upstream_fragment_limit() {
        let mut config = TunnelConfig::new("t.example.com", "secret");
        config.max_upstream_fragment_size = Some(0);
        assert!(config.validate().is_err());

        config.max_upstream_fragment_size = Some(200);
        assert!(config.validate().is_ok());

        let parsed: TunnelConfig = toml::from_str(
            r#"
            topdomain = "t.example.com"
            password = "secret"
            max_upstream_fragment_size = 120
            "#,
        )
        .unwrap();
        assert_eq!(parsed.max_upstream_fragment_size, Some(120));
    }

    #[test]
    fn test_parse_toml() {
        let config: TunnelConfig = toml::from_str(
            r#"
            topdomain = "t.example.com"
            password = "secret"
            codecs = ["base32"]
            record_types = ["txt", "cname"]

            [timing]
            probe_timeout = "500ms"
            idle_timeout = "2m"

            [limits]
            downstream_window = 1
            "#,
        )
        .unwrap();

        assert_eq!(config.codecs, vec![Codec::Base32]);
        assert_eq!(config.record_types, vec![RecordType::Txt, RecordType::Cname]);
        assert_eq!(config.timing.probe_timeout, Duration::from_millis(500));
        assert_eq!(config.timing.idle_timeout, Duration::from_secs(120));
        assert_eq!(config.timing.keepalive_interval, Duration::from_secs(5));
        assert_eq!(config.limits.downstream_window, 1);
        assert_eq!(config.limits.upstream_window, 8);
        assert_eq!(config.edns_payload_size, Some(1232));
        assert!(config.validate().is_ok());
    }
}
