//! Upstream tunnel over a WebSocket.
//!
//! A `Tunnel` is a handle to one transport task. Outgoing messages go in
//! through [`Tunnel::send`]; everything the transport observes comes back as
//! a [`TunnelEvent`]:
//!
//! ```text
//!  RelaySession ──send(bytes)──▶ ┌──────────────┐ ──binary──▶ server
//!               ◀──TunnelEvent── │ transport    │ ◀─bin/text─
//!                                └──────────────┘
//! ```
//!
//! `Open` arrives at most once, `Closed` exactly once unless the handle is
//! closed first, and nothing follows `Closed`.

pub mod tls;
pub mod transport;

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::vless::Destination;

/// Depth of the per-tunnel message queues.
pub const CHANNEL_CAPACITY: usize = 64;

/// Something the transport observed.
#[derive(Debug)]
pub enum TunnelEvent {
    /// Handshake finished; the tunnel accepts data
    Open,
    /// One upstream message, in arrival order
    Message(Bytes),
    /// Transport ended; `None` for a graceful remote close
    Closed(Option<Error>),
}

const TUNNEL_CLOSED: &str = "tunnel closed";

/// Cloneable sending side of a [`Tunnel`].
#[derive(Clone)]
pub struct TunnelSender {
    outbound: mpsc::Sender<Bytes>,
}

impl TunnelSender {
    /// Wait for room in the outbound queue.
    ///
    /// Holding the permit lets the caller decide what to send without
    /// another await point, so message order follows permit use.
    pub async fn reserve(&self) -> Result<mpsc::Permit<'_, Bytes>> {
        self.outbound
            .reserve()
            .await
            .map_err(|_| Error::tunnel(TUNNEL_CLOSED))
    }
}

/// Handle to one upstream connection.
pub struct Tunnel {
    outbound: mpsc::Sender<Bytes>,
    events: mpsc::Receiver<TunnelEvent>,
    task: Option<JoinHandle<()>>,
    closed: bool,
}

impl Tunnel {
    /// Wrap a pair of channels driven by some transport.
    pub fn new(
        outbound: mpsc::Sender<Bytes>,
        events: mpsc::Receiver<TunnelEvent>,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            outbound,
            events,
            task,
            closed: false,
        }
    }

    /// Queue one binary message.
    pub async fn send(&self, data: Bytes) -> Result<()> {
        if self.closed {
            return Err(Error::tunnel(TUNNEL_CLOSED));
        }
        self.outbound
            .send(data)
            .await
            .map_err(|_| Error::tunnel(TUNNEL_CLOSED))
    }

    /// See [`TunnelSender::reserve`].
    pub async fn reserve(&self) -> Result<mpsc::Permit<'_, Bytes>> {
        if self.closed {
            return Err(Error::tunnel(TUNNEL_CLOSED));
        }
        self.outbound
            .reserve()
            .await
            .map_err(|_| Error::tunnel(TUNNEL_CLOSED))
    }

    /// A sender that can be used while events are being received.
    pub fn sender(&self) -> TunnelSender {
        TunnelSender {
            outbound: self.outbound.clone(),
        }
    }

    /// The error of an already queued `Closed` event, if any.
    ///
    /// Messages queued ahead of it are discarded.
    pub fn pending_close_error(&mut self) -> Option<Error> {
        if self.closed {
            return None;
        }
        while let Ok(event) = self.events.try_recv() {
            if let TunnelEvent::Closed(error) = event {
                return error;
            }
        }
        None
    }

    /// Next transport event; `None` once the tunnel is closed.
    pub async fn next_event(&mut self) -> Option<TunnelEvent> {
        if self.closed {
            return None;
        }
        self.events.recv().await
    }

    /// Tear down the transport. Safe to call more than once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.events.close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens tunnels for relay sessions.
pub trait Connect: Send + Sync + 'static {
    fn open(&self, destination: &Destination) -> Tunnel;
}

/// Opens WebSocket tunnels described by a [`Config`].
#[derive(Clone)]
pub struct WsConnector {
    config: Arc<Config>,
    tls: Option<TlsConnector>,
}

impl WsConnector {
    /// Create a connector; the TLS configuration is built once up front.
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let tls = if config.uses_tls() {
            Some(tls::build_connector(config.allow_untrusted_certificate)?)
        } else {
            None
        };
        Ok(Self { config, tls })
    }
}

impl Connect for WsConnector {
    fn open(&self, destination: &Destination) -> Tunnel {
        tracing::debug!("Opening tunnel for {}", destination);

        let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let task = tokio::spawn(transport::run(
            Arc::clone(&self.config),
            self.tls.clone(),
            out_rx,
            event_tx,
        ));
        Tunnel::new(out_tx, event_rx, Some(task))
    }
}
