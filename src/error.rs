//! Error types for the proxy.

use thiserror::Error;

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while serving a client connection.
///
/// Every variant is fatal to the one connection it was raised on and
/// never to the listener.
#[derive(Error, Debug)]
pub enum Error {
    /// Client spoke the wrong protocol version
    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    ProtocolMismatch { expected: u8, actual: u8 },

    /// SOCKS5 command other than CONNECT
    #[error("unsupported SOCKS5 command: 0x{0:02x}")]
    UnsupportedCommand(u8),

    /// Unparsable HTTP request line or SOCKS5 request
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// Domain name longer than a single length byte can describe
    #[error("address too long: {0} bytes")]
    AddressTooLong(usize),

    /// Host string that cannot be encoded
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Upstream identifier is not 32 hex digits
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// Transport handshake or I/O failure
    #[error("tunnel error: {0}")]
    Tunnel(String),

    /// Transport handshake did not finish in time
    #[error("connection timeout after {0}ms")]
    Timeout(u64),

    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a new malformed request error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Error::MalformedRequest(msg.into())
    }

    /// Create a new tunnel error
    pub fn tunnel(msg: impl Into<String>) -> Self {
        Error::Tunnel(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Check if this error came from a client speaking a bad protocol
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Error::ProtocolMismatch { .. }
                | Error::UnsupportedCommand(_)
                | Error::MalformedRequest(_)
                | Error::AddressTooLong(_)
                | Error::InvalidAddress(_)
        )
    }

    /// Check if this error came from the upstream transport
    pub fn is_tunnel_error(&self) -> bool {
        matches!(self, Error::Tunnel(_) | Error::Timeout(_))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Tunnel(e.to_string())
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Error::Tunnel(format!("TLS: {}", e))
    }
}
