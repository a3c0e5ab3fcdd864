//! Local proxy front end.
//!
//! ```text
//!  client ──▶ Dispatcher ──peek──▶ SOCKS5 / HTTP handshake
//!                                        │ Negotiated
//!                                        ▼
//!                                  RelaySession ◀──▶ Tunnel
//! ```
//!
//! Handshakes are pure state machines: they consume client bytes and hand
//! back replies plus, eventually, the destination. All I/O lives in
//! [`session`] and [`dispatcher`].

pub mod dispatcher;
pub mod http;
pub mod metrics;
pub mod session;
pub mod socks5;

pub use dispatcher::{classify, Dispatcher, Protocol};
pub use http::HttpHandshake;
pub use metrics::{ConnectionTicket, MetricsSnapshot, ProxyMetrics};
pub use session::{RelaySession, SessionState, UpstreamGate};
pub use socks5::Socks5Handshake;

use std::sync::Arc;

use bytes::Bytes;

use crate::config::Config;
use crate::error::Result;
use crate::sink::EventSink;
use crate::tunnel::Connect;
use crate::vless::Destination;

/// Client-side protocol negotiation.
pub trait Handshake: Send {
    /// Consume newly read client bytes.
    ///
    /// Bytes may arrive in arbitrarily small pieces; incomplete input is
    /// buffered. Errors are fatal for the connection.
    fn feed(&mut self, data: &[u8]) -> Result<Progress>;

    /// Called once the replies from the last call are written to the client.
    fn replies_flushed(&mut self) -> Result<Progress> {
        Ok(Progress::default())
    }
}

/// Outcome of one [`Handshake::feed`] call.
#[derive(Debug, Default)]
pub struct Progress {
    /// Bytes to write back to the client, in order
    pub replies: Vec<Bytes>,
    /// Set once the destination is known
    pub negotiated: Option<Negotiated>,
}

/// A finished handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub destination: Destination,
    /// Client bytes that must follow the request header upstream
    pub initial_data: Bytes,
}

/// Shared state every connection task needs.
#[derive(Clone)]
pub struct ProxyContext {
    pub config: Arc<Config>,
    pub connector: Arc<dyn Connect>,
    pub sink: Arc<dyn EventSink>,
    pub metrics: Arc<ProxyMetrics>,
}
