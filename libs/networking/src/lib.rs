//! Address parsing for threat feeds.
//!
//! This library provides helpers for:
//! - IPv4 and IPv6 prefix parsing and masking
//! - Normalizing feed entries (bare addresses become host prefixes)
//! - Parsing whole newline-delimited feeds

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use thiserror::Error;

/// Networking errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NetworkError {
    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR prefix.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),
}

// ============================================================================
// Prefixes
// ============================================================================

/// IPv4 network prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Prefix {
    /// Network address (host bits cleared).
    pub address: Ipv4Addr,

    /// Prefix length (e.g., 24 for /24).
    pub prefix_len: u8,
}

impl Ipv4Prefix {
    /// Create a new prefix, masking host bits.
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Result<Self, NetworkError> {
        if prefix_len > 32 {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {} exceeds 32",
                prefix_len
            )));
        }

        Ok(Self {
            address: mask_ipv4(address, prefix_len),
            prefix_len,
        })
    }

    /// Check if an address is within this prefix.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        mask_ipv4(addr, self.prefix_len) == self.address
    }
}

impl fmt::Display for Ipv4Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

/// IPv6 network prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv6Prefix {
    /// Network address (host bits cleared).
    pub address: Ipv6Addr,

    /// Prefix length (e.g., 64 for /64).
    pub prefix_len: u8,
}

impl Ipv6Prefix {
    /// Create a new prefix, masking host bits.
    pub fn new(address: Ipv6Addr, prefix_len: u8) -> Result<Self, NetworkError> {
        if prefix_len > 128 {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {} exceeds 128",
                prefix_len
            )));
        }

        Ok(Self {
            address: mask_ipv6(address, prefix_len),
            prefix_len,
        })
    }

    /// Check if an address is within this prefix.
    pub fn contains(&self, addr: Ipv6Addr) -> bool {
        mask_ipv6(addr, self.prefix_len) == self.address
    }
}

impl fmt::Display for Ipv6Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

/// An IPv4 or IPv6 prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpPrefix {
    V4(Ipv4Prefix),
    V6(Ipv6Prefix),
}

impl IpPrefix {
    /// Host prefix (/32 or /128) for a single address.
    pub fn host(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(a) => IpPrefix::V4(Ipv4Prefix {
                address: a,
                prefix_len: 32,
            }),
            IpAddr::V6(a) => IpPrefix::V6(Ipv6Prefix {
                address: a,
                prefix_len: 128,
            }),
        }
    }

    /// Parse CIDR notation ("10.0.0.0/8", "2000::/5").
    pub fn from_cidr(s: &str) -> Result<Self, NetworkError> {
        let Some((addr_str, prefix_str)) = s.split_once('/') else {
            return Err(NetworkError::InvalidPrefix(format!(
                "missing '/' in CIDR: {}",
                s
            )));
        };

        let address = IpAddr::from_str(addr_str)
            .map_err(|_| NetworkError::InvalidAddress(addr_str.to_string()))?;

        // Reject signs and leading junk that u8::from_str would accept.
        if prefix_str.is_empty() || !prefix_str.bytes().all(|b| b.is_ascii_digit()) {
            return Err(NetworkError::InvalidPrefix(prefix_str.to_string()));
        }
        let prefix_len = prefix_str
            .parse::<u8>()
            .map_err(|_| NetworkError::InvalidPrefix(prefix_str.to_string()))?;

        match address {
            IpAddr::V4(a) => Ipv4Prefix::new(a, prefix_len).map(IpPrefix::V4),
            IpAddr::V6(a) => Ipv6Prefix::new(a, prefix_len).map(IpPrefix::V6),
        }
    }

    /// Prefix length.
    pub fn prefix_len(&self) -> u8 {
        match self {
            IpPrefix::V4(p) => p.prefix_len,
            IpPrefix::V6(p) => p.prefix_len,
        }
    }

    /// Check if an address is within this prefix. Never true across families.
    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self, addr) {
            (IpPrefix::V4(p), IpAddr::V4(a)) => p.contains(a),
            (IpPrefix::V6(p), IpAddr::V6(a)) => p.contains(a),
            _ => false,
        }
    }
}

impl FromStr for IpPrefix {
    type Err = NetworkError;

    /// Parse either CIDR notation or a bare address.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains('/') {
            return Self::from_cidr(s);
        }
        IpAddr::from_str(s)
            .map(Self::host)
            .map_err(|_| NetworkError::InvalidAddress(s.to_string()))
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpPrefix::V4(p) => fmt::Display::fmt(p, f),
            IpPrefix::V6(p) => fmt::Display::fmt(p, f),
        }
    }
}

/// Mask an IPv4 address to a prefix length.
fn mask_ipv4(addr: Ipv4Addr, prefix_len: u8) -> Ipv4Addr {
    let bits = u32::from(addr);
    let mask = if prefix_len == 0 {
        0
    } else if prefix_len >= 32 {
        u32::MAX
    } else {
        u32::MAX << (32 - prefix_len)
    };
    Ipv4Addr::from(bits & mask)
}

/// Mask an IPv6 address to a prefix length.
fn mask_ipv6(addr: Ipv6Addr, prefix_len: u8) -> Ipv6Addr {
    let bits = u128::from_be_bytes(addr.octets());
    let mask = if prefix_len == 0 {
        0
    } else if prefix_len >= 128 {
        u128::MAX
    } else {
        u128::MAX << (128 - prefix_len)
    };
    Ipv6Addr::from((bits & mask).to_be_bytes())
}

// ============================================================================
// Feed parsing
// ============================================================================

/// Normalize one feed line.
///
/// Returns `Ok(None)` for blank lines and `#` comments.
pub fn normalize_entry(line: &str) -> Result<Option<IpPrefix>, NetworkError> {
    let entry = line.trim();
    if entry.is_empty() || entry.starts_with('#') {
        return Ok(None);
    }
    entry.parse().map(Some)
}

/// A rejected feed line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedEntry {
    /// 1-based line number.
    pub line: usize,
    pub error: NetworkError,
}

/// Result of parsing a whole feed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedFeed {
    /// Normalized prefixes in feed order.
    pub entries: Vec<String>,

    /// Lines that could not be parsed.
    pub rejected: Vec<RejectedEntry>,
}

/// Parse a newline-delimited feed.
pub fn parse_feed(text: &str) -> ParsedFeed {
    let mut parsed = ParsedFeed::default();
    for (idx, line) in text.lines().enumerate() {
        match normalize_entry(line) {
            Ok(Some(prefix)) => parsed.entries.push(prefix.to_string()),
            Ok(None) => {}
            Err(error) => parsed.rejected.push(RejectedEntry {
                line: idx + 1,
                error,
            }),
        }
    }
    parsed
}
