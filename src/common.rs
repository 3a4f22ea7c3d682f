//! Topdomain validation and socket address helpers
//!
//! Everything here is stateless. The topdomain is checked once at startup and
//! wrapped in [`Topdomain`] so the framer never sees an unchecked suffix.

use crate::TunnelError;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};

/// Longest accepted topdomain. The rest of the 255-byte name is left for
/// header and payload labels.
pub const MAX_TOPDOMAIN_LEN: usize = 128;

/// Shortest accepted topdomain (`a.b`)
pub const MIN_TOPDOMAIN_LEN: usize = 3;

/// Maximum bytes per DNS label (RFC 1035)
pub const MAX_LABEL_LEN: usize = 63;

/// Returns `true` when `name` is NOT usable as a topdomain.
pub fn check_topdomain(name: &str) -> bool {
    validate_topdomain(name).is_err()
}

/// Validate a topdomain, reporting why it was rejected.
pub fn validate_topdomain(name: &str) -> Result<(), TunnelError> {
    let invalid = |reason: &str| Err(TunnelError::Validation(format!("topdomain {:?}: {}", name, reason)));

    if name.len() < MIN_TOPDOMAIN_LEN {
        return invalid("too short (< 3)");
    }
    if name.len() > MAX_TOPDOMAIN_LEN {
        return invalid("too long (> 128)");
    }
    if name.starts_with('.') {
        return invalid("starts with a dot");
    }

    let mut dots = 0;
    let mut label_len = 0;
    for c in name.chars() {
        if c == '.' {
            dots += 1;
            if label_len == 0 {
                return invalid("consecutive dots");
            }
            if label_len > MAX_LABEL_LEN {
                return invalid("label longer than 63 bytes");
            }
            label_len = 0;
        } else if c.is_ascii_alphanumeric() || c == '-' {
            label_len += 1;
        } else {
            return invalid("contains illegal character (allowed: [a-zA-Z0-9-.])");
        }
    }

    if label_len == 0 {
        return invalid("ends with a dot");
    }
    if label_len > MAX_LABEL_LEN {
        return invalid("label longer than 63 bytes");
    }
    if dots == 0 {
        return invalid("no dots");
    }
    Ok(())
}

/// A validated topdomain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topdomain(String);

impl Topdomain {
    pub fn new(name: &str) -> Result<Self, TunnelError> {
        validate_topdomain(name)?;
        Ok(Self(name.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn labels(&self) -> impl Iterator<Item = &[u8]> {
        self.0.split('.').map(str::as_bytes)
    }

    /// Length of the topdomain in wire format: one length byte per label,
    /// the label bytes and the root terminator.
    pub fn wire_len(&self) -> usize {
        self.0.len() + 2
    }

    /// Check whether `labels` end with this topdomain (case-insensitive) and
    /// return how many leading labels carry tunnel data.
    pub fn strip_from(&self, labels: &[Vec<u8>]) -> Option<usize> {
        let own: Vec<&[u8]> = self.labels().collect();
        if labels.len() <= own.len() {
            return None;
        }
        let data_labels = labels.len() - own.len();
        let matches = labels[data_labels..]
            .iter()
            .zip(own.iter())
            .all(|(theirs, ours)| theirs.eq_ignore_ascii_case(ours));
        matches.then_some(data_labels)
    }
}

impl fmt::Display for Topdomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Address family hint for [`get_addr`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrFamily {
    Unspec,
    Inet,
    Inet6,
}

impl AddrFamily {
    fn accepts(self, ip: &IpAddr) -> bool {
        match self {
            AddrFamily::Unspec => true,
            AddrFamily::Inet => ip.is_ipv4(),
            AddrFamily::Inet6 => ip.is_ipv6(),
        }
    }
}

/// Lookup flags for [`get_addr`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddrFlags {
    /// With no host, return the wildcard address instead of loopback
    pub passive: bool,
}

impl AddrFlags {
    pub const NONE: AddrFlags = AddrFlags { passive: false };
    pub const PASSIVE: AddrFlags = AddrFlags { passive: true };
}

/// Size of the platform socket address structure for `addr`
pub fn sockaddr_len(addr: &SocketAddr) -> usize {
    match addr {
        SocketAddr::V4(_) => std::mem::size_of::<libc::sockaddr_in>(),
        SocketAddr::V6(_) => std::mem::size_of::<libc::sockaddr_in6>(),
    }
}

/// Resolve `host` (or the wildcard/loopback address when `host` is `None`)
/// into a socket address of the requested family.
pub fn get_addr(
    host: Option<&str>,
    port: u16,
    family: AddrFamily,
    flags: AddrFlags,
) -> Result<(SocketAddr, usize), TunnelError> {
    let addr = match host {
        None => {
            let ip: IpAddr = match (family, flags.passive) {
                (AddrFamily::Inet6, true) => Ipv6Addr::UNSPECIFIED.into(),
                (AddrFamily::Inet6, false) => Ipv6Addr::LOCALHOST.into(),
                (_, true) => Ipv4Addr::UNSPECIFIED.into(),
                (_, false) => Ipv4Addr::LOCALHOST.into(),
            };
            SocketAddr::new(ip, port)
        }
        Some(host) => resolve(host, port, family)?,
    };
    Ok((addr, sockaddr_len(&addr)))
}

fn resolve(host: &str, port: u16, family: AddrFamily) -> Result<SocketAddr, TunnelError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        if !family.accepts(&ip) {
            return Err(TunnelError::Resolution(format!(
                "{} is not a {:?} address",
                host, family
            )));
        }
        return Ok(SocketAddr::new(ip, port));
    }

    let candidates = (host, port)
        .to_socket_addrs()
        .map_err(|e| TunnelError::Resolution(format!("{}: {}", host, e)))?;

    candidates
        .into_iter()
        .find(|addr| family.accepts(&addr.ip()))
        .ok_or_else(|| TunnelError::Resolution(format!("{}: no {:?} address", host, family)))
}

/// Render the address part of `addr` in canonical form. IPv4-mapped IPv6
/// addresses come out as plain dotted quads.
pub fn format_addr(addr: &SocketAddr, len: usize) -> String {
    if len < sockaddr_len(addr) {
        return String::from("<invalid address>");
    }
    match addr.ip() {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topdomain_reasons() {
        let err = validate_topdomain("abc..defgh").unwrap_err();
        assert!(err.to_string().contains("consecutive dots"));

        let err = validate_topdomain("under_score.com").unwrap_err();
        assert!(err.to_string().contains("illegal character"));
    }

    #[test]
    fn test_topdomain_strip() {
        let top = Topdomain::new("t.Example.com").unwrap();
        assert_eq!(top.as_str(), "t.example.com");
        assert_eq!(top.wire_len(), 15);

        let labels: Vec<Vec<u8>> = ["abc", "def", "T", "EXAMPLE", "com"]
            .iter()
            .map(|l| l.as_bytes().to_vec())
            .collect();
        assert_eq!(top.strip_from(&labels), Some(2));

        let foreign: Vec<Vec<u8>> = ["abc", "other", "com"]
            .iter()
            .map(|l| l.as_bytes().to_vec())
            .collect();
        assert_eq!(top.strip_from(&foreign), None);

        // the bare topdomain carries no data
        let bare: Vec<Vec<u8>> = top.labels().map(|l| l.to_vec()).collect();
        assert_eq!(top.strip_from(&bare), None);
    }

    #[test]
    fn test_family_mismatch_is_resolution_error() {
        let err = get_addr(Some("2001:db8::1"), 53, AddrFamily::Inet, AddrFlags::NONE).unwrap_err();
        assert!(matches!(err, TunnelError::Resolution(_)));

        let err = get_addr(Some("10.0.0.1"), 53, AddrFamily::Inet6, AddrFlags::NONE).unwrap_err();
        assert!(matches!(err, TunnelError::Resolution(_)));
    }

    #[test]
    fn test_loopback_without_passive() {
        let (addr, len) = get_addr(None, 5353, AddrFamily::Inet6, AddrFlags::NONE).unwrap();
        assert_eq!(addr, "[::1]:5353".parse::<SocketAddr>().unwrap());
        assert_eq!(format_addr(&addr, len), "::1");
    }
}
