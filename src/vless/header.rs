//! VLESS request header encoding and one-time response header stripping.
//!
//! Request header layout:
//!
//! ```text
//! version(1)=0 | id(16) | addon_len(1)=0 | command(1)=1 | port(2, BE) | atyp(1) | address
//! ```
//!
//! Response header layout: `version(1) | addon_len(1) | addons(addon_len)`.

use std::fmt;
use std::str::FromStr;

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::vless::address::{decode_address, encode_address, Destination};

/// Request header version byte.
pub const VERSION: u8 = 0x00;

/// TCP command.
pub const COMMAND_TCP: u8 = 0x01;

/// Fixed part of the request header before the address type.
const FIXED_HEADER_LEN: usize = 1 + 16 + 1 + 1 + 2;

/// 128-bit user identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Identifier([u8; 16]);

impl Identifier {
    /// Wrap raw identifier bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Raw identifier bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl FromStr for Identifier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let digits: String = s.chars().filter(|c| *c != '-').collect();
        if digits.len() != 32 {
            return Err(Error::InvalidIdentifier(s.to_string()));
        }
        let bytes = hex::decode(&digits).map_err(|_| Error::InvalidIdentifier(s.to_string()))?;
        let mut id = [0u8; 16];
        id.copy_from_slice(&bytes);
        Ok(Self(id))
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let h = hex::encode(self.0);
        write!(f, "{}-{}-{}-{}-{}", &h[..8], &h[8..12], &h[12..16], &h[16..20], &h[20..])
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identifier({})", self)
    }
}

/// Build the request header for a TCP connection to `destination`.
pub fn build_request_header(identifier: &str, destination: &Destination) -> Result<Bytes> {
    let id: Identifier = identifier.parse()?;
    let (atyp, address) = encode_address(&destination.host)?;

    let mut buf = BytesMut::with_capacity(FIXED_HEADER_LEN + 1 + address.len());
    buf.extend_from_slice(&[VERSION]);
    buf.extend_from_slice(id.as_bytes());
    buf.extend_from_slice(&[0x00, COMMAND_TCP]);
    buf.extend_from_slice(&destination.port.to_be_bytes());
    buf.extend_from_slice(&[atyp]);
    buf.extend_from_slice(&address);
    Ok(buf.freeze())
}

/// A decoded request header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    pub identifier: Identifier,
    pub command: u8,
    pub atyp: u8,
    pub destination: Destination,
}

impl RequestHeader {
    /// Decode a request header, returning it and the number of bytes used.
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < FIXED_HEADER_LEN {
            return Err(Error::malformed(format!(
                "request header too short: {} bytes",
                data.len()
            )));
        }
        if data[0] != VERSION {
            return Err(Error::ProtocolMismatch {
                expected: VERSION,
                actual: data[0],
            });
        }

        let mut id = [0u8; 16];
        id.copy_from_slice(&data[1..17]);

        let addon_len = data[17] as usize;
        let mut pos = 18 + addon_len;
        // command, port, address type
        if data.len() < pos + 4 {
            return Err(Error::malformed("request header truncated"));
        }

        let command = data[pos];
        let port = u16::from_be_bytes([data[pos + 1], data[pos + 2]]);
        pos += 3;

        let atyp = data[pos];
        let (host, used) = decode_address(&data[pos..])?;

        Ok((
            Self {
                identifier: Identifier::from_bytes(id),
                command,
                atyp,
                destination: Destination::new(host, port),
            },
            pos + used,
        ))
    }
}

/// Removes the response header from the first upstream message(s).
///
/// The header may straddle several messages, so bytes are accumulated until
/// the full `2 + addon_len` prefix is available. After that every message is
/// passed through untouched.
#[derive(Debug)]
pub enum ResponseStripper {
    Pending(BytesMut),
    PassThrough,
}

impl Default for ResponseStripper {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseStripper {
    /// A stripper waiting for the header.
    pub fn new() -> Self {
        ResponseStripper::Pending(BytesMut::new())
    }

    /// Whether the header has been removed.
    pub fn is_done(&self) -> bool {
        matches!(self, ResponseStripper::PassThrough)
    }

    /// Feed one upstream message; returns the payload to forward, if any.
    pub fn process(&mut self, message: Bytes) -> Option<Bytes> {
        let acc = match self {
            ResponseStripper::PassThrough => {
                return (!message.is_empty()).then_some(message);
            }
            ResponseStripper::Pending(acc) => acc,
        };

        acc.extend_from_slice(&message);
        if acc.len() < 2 {
            return None;
        }
        let header_len = 2 + acc[1] as usize;
        if acc.len() < header_len {
            return None;
        }

        let payload = acc.split_off(header_len).freeze();
        *self = ResponseStripper::PassThrough;
        (!payload.is_empty()).then_some(payload)
    }
}
