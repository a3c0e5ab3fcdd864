//! Destination addresses and their VLESS wire encoding.

use std::fmt;
use std::net::Ipv6Addr;

use crate::error::{Error, Result};

/// VLESS address type: IPv4 (4 bytes).
pub const ATYP_IPV4: u8 = 0x01;
/// VLESS address type: domain (length byte + bytes).
pub const ATYP_DOMAIN: u8 = 0x02;
/// VLESS address type: IPv6 (16 bytes).
pub const ATYP_IPV6: u8 = 0x03;

/// Longest domain a single length byte can describe.
pub const MAX_DOMAIN_LEN: usize = 255;

/// The shape of a host string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    Ipv4,
    Domain,
    Ipv6,
}

impl AddressKind {
    /// Classify a host string.
    ///
    /// A `host:port` pair has exactly one colon and is therefore a domain;
    /// only bracketed hosts or hosts with two or more colons are IPv6.
    pub fn classify(host: &str) -> Self {
        if is_ipv4_literal(host) {
            AddressKind::Ipv4
        } else if (host.starts_with('[') && host.ends_with(']'))
            || host.matches(':').count() >= 2
        {
            AddressKind::Ipv6
        } else {
            AddressKind::Domain
        }
    }

    /// VLESS address type byte.
    pub fn atyp(self) -> u8 {
        match self {
            AddressKind::Ipv4 => ATYP_IPV4,
            AddressKind::Domain => ATYP_DOMAIN,
            AddressKind::Ipv6 => ATYP_IPV6,
        }
    }
}

fn is_ipv4_literal(host: &str) -> bool {
    let fields: Vec<&str> = host.split('.').collect();
    fields.len() == 4 && fields.iter().all(|f| f.parse::<u8>().is_ok())
}

/// Encode a host as `(address type, address bytes)`.
pub fn encode_address(host: &str) -> Result<(u8, Vec<u8>)> {
    let kind = AddressKind::classify(host);
    let bytes = match kind {
        AddressKind::Ipv4 => host
            .split('.')
            .map(|f| f.parse::<u8>())
            .collect::<std::result::Result<Vec<u8>, _>>()
            .map_err(|_| Error::InvalidAddress(host.to_string()))?,
        AddressKind::Ipv6 => {
            let bare = host.trim_start_matches('[').trim_end_matches(']');
            let ip: Ipv6Addr = bare
                .parse()
                .map_err(|_| Error::InvalidAddress(host.to_string()))?;
            ip.octets().to_vec()
        }
        AddressKind::Domain => {
            let raw = host.as_bytes();
            if raw.len() > MAX_DOMAIN_LEN {
                return Err(Error::AddressTooLong(raw.len()));
            }
            let mut bytes = Vec::with_capacity(1 + raw.len());
            bytes.push(raw.len() as u8);
            bytes.extend_from_slice(raw);
            bytes
        }
    };
    Ok((kind.atyp(), bytes))
}

/// Decode a VLESS address starting at `data[0]` (the type byte).
///
/// Returns the host and the number of bytes consumed.
pub fn decode_address(data: &[u8]) -> Result<(String, usize)> {
    let atyp = *data
        .first()
        .ok_or_else(|| Error::InvalidAddress("empty address".into()))?;
    match atyp {
        ATYP_IPV4 => {
            let b = data
                .get(1..5)
                .ok_or_else(|| Error::InvalidAddress("IPv4 address too short".into()))?;
            Ok((format!("{}.{}.{}.{}", b[0], b[1], b[2], b[3]), 5))
        }
        ATYP_DOMAIN => {
            let len = *data
                .get(1)
                .ok_or_else(|| Error::InvalidAddress("domain address too short".into()))?
                as usize;
            let raw = data
                .get(2..2 + len)
                .ok_or_else(|| Error::InvalidAddress("domain address truncated".into()))?;
            let domain = std::str::from_utf8(raw)
                .map_err(|_| Error::InvalidAddress("domain is not UTF-8".into()))?;
            Ok((domain.to_string(), 2 + len))
        }
        ATYP_IPV6 => {
            let b = data
                .get(1..17)
                .ok_or_else(|| Error::InvalidAddress("IPv6 address too short".into()))?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(b);
            Ok((Ipv6Addr::from(octets).to_string(), 17))
        }
        _ => Err(Error::InvalidAddress(format!(
            "unknown address type: 0x{:02x}",
            atyp
        ))),
    }
}

/// Where a client wants to go.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    /// IPv4 literal, domain, or IPv6 literal without brackets
    pub host: String,
    pub port: u16,
}

impl Destination {
    /// Create a destination, stripping brackets from IPv6 literals.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let host = match host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
            Some(bare) => bare.to_string(),
            None => host,
        };
        Self { host, port }
    }

    /// Address kind of the host.
    pub fn kind(&self) -> AddressKind {
        AddressKind::classify(&self.host)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            AddressKind::Ipv6 => write!(f, "[{}]:{}", self.host, self.port),
            _ => write!(f, "{}:{}", self.host, self.port),
        }
    }
}
