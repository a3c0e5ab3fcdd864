//! SOCKS5 handshake state machine (no-auth, CONNECT only).
//!
//! Input is fed in whatever chunks the socket delivers; nothing is consumed
//! until a whole greeting or request frame is buffered.

use std::net::Ipv6Addr;

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::proxy::{Handshake, Negotiated, Progress};
use crate::vless::Destination;

/// SOCKS protocol version.
pub const SOCKS_VERSION: u8 = 0x05;
/// CONNECT command.
pub const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Method selection reply: no authentication required.
pub const METHOD_REPLY: [u8; 2] = [SOCKS_VERSION, 0x00];

/// CONNECT success reply. The bound address is always reported as zero.
pub const SUCCESS_REPLY: [u8; 10] = [SOCKS_VERSION, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];

/// Handshake state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Socks5State {
    AwaitGreeting,
    /// Greeting consumed; waiting for the driver to flush the method reply
    AwaitMethodAck,
    AwaitRequest,
    Done,
}

/// SOCKS5 server-side handshake.
#[derive(Debug)]
pub struct Socks5Handshake {
    state: Socks5State,
    buf: BytesMut,
}

impl Default for Socks5Handshake {
    fn default() -> Self {
        Self::new()
    }
}

impl Socks5Handshake {
    pub fn new() -> Self {
        Self {
            state: Socks5State::AwaitGreeting,
            buf: BytesMut::with_capacity(64),
        }
    }

    pub fn state(&self) -> Socks5State {
        self.state
    }

    /// Bytes buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    fn parse_greeting(&mut self) -> Result<Option<Bytes>> {
        if self.buf.len() < 2 {
            return Ok(None);
        }
        if self.buf[0] != SOCKS_VERSION {
            return Err(Error::ProtocolMismatch {
                expected: SOCKS_VERSION,
                actual: self.buf[0],
            });
        }
        let frame_len = 2 + self.buf[1] as usize;
        if self.buf.len() < frame_len {
            return Ok(None);
        }
        self.buf.advance(frame_len);
        self.state = Socks5State::AwaitMethodAck;
        Ok(Some(Bytes::from_static(&METHOD_REPLY)))
    }

    fn parse_request(&mut self) -> Result<Option<Destination>> {
        if self.buf.len() < 7 {
            return Ok(None);
        }
        if self.buf[0] != SOCKS_VERSION {
            return Err(Error::ProtocolMismatch {
                expected: SOCKS_VERSION,
                actual: self.buf[0],
            });
        }
        if self.buf[1] != CMD_CONNECT {
            return Err(Error::UnsupportedCommand(self.buf[1]));
        }

        let (addr_len, addr_start) = match self.buf[3] {
            ATYP_IPV4 => (4, 4),
            ATYP_DOMAIN => (self.buf[4] as usize, 5),
            ATYP_IPV6 => (16, 4),
            other => {
                return Err(Error::malformed(format!(
                    "unknown SOCKS5 address type: 0x{:02x}",
                    other
                )))
            }
        };
        let frame_len = addr_start + addr_len + 2;
        if self.buf.len() < frame_len {
            return Ok(None);
        }

        let frame = self.buf.split_to(frame_len);
        let raw = &frame[addr_start..addr_start + addr_len];
        let host = match frame[3] {
            ATYP_IPV4 => format!("{}.{}.{}.{}", raw[0], raw[1], raw[2], raw[3]),
            ATYP_DOMAIN => std::str::from_utf8(raw)
                .map_err(|_| Error::malformed("SOCKS5 domain is not UTF-8"))?
                .to_string(),
            _ => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(raw);
                Ipv6Addr::from(octets).to_string()
            }
        };
        let port = u16::from_be_bytes([frame[frame_len - 2], frame[frame_len - 1]]);
        Ok(Some(Destination::new(host, port)))
    }
}

impl Handshake for Socks5Handshake {
    fn feed(&mut self, data: &[u8]) -> Result<Progress> {
        if self.state == Socks5State::Done {
            return Err(Error::malformed("SOCKS5 handshake already complete"));
        }
        self.buf.extend_from_slice(data);

        match self.state {
            Socks5State::AwaitGreeting => {
                let mut progress = Progress::default();
                if let Some(reply) = self.parse_greeting()? {
                    progress.replies.push(reply);
                }
                Ok(progress)
            }
            // Request bytes wait until the method reply is on the wire.
            Socks5State::AwaitMethodAck => Ok(Progress::default()),
            _ => self.advance_request(),
        }
    }

    fn replies_flushed(&mut self) -> Result<Progress> {
        if self.state != Socks5State::AwaitMethodAck {
            return Ok(Progress::default());
        }
        self.state = Socks5State::AwaitRequest;
        self.advance_request()
    }
}

impl Socks5Handshake {
    fn advance_request(&mut self) -> Result<Progress> {
        let mut progress = Progress::default();
        if let Some(destination) = self.parse_request()? {
            self.state = Socks5State::Done;
            progress.replies.push(Bytes::from_static(&SUCCESS_REPLY));
            progress.negotiated = Some(Negotiated {
                destination,
                initial_data: self.buf.split().freeze(),
            });
        }
        Ok(progress)
    }
}
