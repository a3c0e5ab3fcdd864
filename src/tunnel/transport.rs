//! WebSocket transport task.
//!
//! One task per tunnel: it performs the TCP/TLS/WebSocket handshake under a
//! timeout, then moves binary messages between the channels owned by the
//! `Tunnel` handle and the socket.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::HOST;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{client_async, WebSocketStream};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::tunnel::{tls, TunnelEvent};
use crate::vless::{AddressKind, Destination};

/// Upstream WebSocket URL; the configured path (and its query) is kept verbatim.
pub fn websocket_url(config: &Config) -> String {
    let scheme = if config.uses_tls() { "wss" } else { "ws" };
    let path = if config.path.starts_with('/') {
        config.path.clone()
    } else {
        format!("/{}", config.path)
    };
    format!(
        "{}://{}:{}{}",
        scheme,
        bracketed(config.ws_host()),
        config.port,
        path
    )
}

/// Value of the `Host` header sent during the upgrade.
pub fn host_header(config: &Config) -> String {
    let default_port = if config.uses_tls() { 443 } else { 80 };
    let host = bracketed(config.ws_host());
    if config.port == default_port {
        host
    } else {
        format!("{}:{}", host, config.port)
    }
}

fn bracketed(host: &str) -> String {
    if AddressKind::classify(host) == AddressKind::Ipv6 && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}

/// Build the upgrade request.
pub fn build_request(config: &Config) -> Result<Request> {
    let mut request = websocket_url(config).into_client_request()?;
    let host = HeaderValue::from_str(&host_header(config))
        .map_err(|e| Error::config(format!("invalid ws_host: {}", e)))?;
    request.headers_mut().insert(HOST, host);
    Ok(request)
}

/// Delivers tunnel events with the open/close guarantees.
///
/// `Open` is sent at most once, and nothing is sent after `Closed`.
pub(crate) struct EventEmitter {
    tx: mpsc::Sender<TunnelEvent>,
    opened: bool,
    closed: bool,
}

impl EventEmitter {
    pub(crate) fn new(tx: mpsc::Sender<TunnelEvent>) -> Self {
        Self {
            tx,
            opened: false,
            closed: false,
        }
    }

    /// Returns false once nobody is listening.
    pub(crate) async fn open(&mut self) -> bool {
        if self.closed {
            return false;
        }
        if self.opened {
            return true;
        }
        self.opened = true;
        self.tx.send(TunnelEvent::Open).await.is_ok()
    }

    pub(crate) async fn message(&mut self, data: Bytes) -> bool {
        if self.closed {
            return false;
        }
        self.tx.send(TunnelEvent::Message(data)).await.is_ok()
    }

    pub(crate) async fn close(&mut self, error: Option<Error>) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.tx.send(TunnelEvent::Closed(error)).await;
    }
}

enum Upstream {
    Plain(WebSocketStream<TcpStream>),
    Tls(WebSocketStream<tokio_rustls::client::TlsStream<TcpStream>>),
}

/// Run one tunnel until either side goes away.
pub(crate) async fn run(
    config: Arc<Config>,
    tls: Option<TlsConnector>,
    mut outbound: mpsc::Receiver<Bytes>,
    events: mpsc::Sender<TunnelEvent>,
) {
    let mut emitter = EventEmitter::new(events);
    let timeout = config.connect_timeout();

    match tokio::time::timeout(timeout, connect(&config, tls)).await {
        Err(_) => {
            emitter
                .close(Some(Error::Timeout(timeout.as_millis() as u64)))
                .await
        }
        Ok(Err(e)) => emitter.close(Some(e)).await,
        Ok(Ok(Upstream::Plain(ws))) => pump(ws, &mut outbound, &mut emitter).await,
        Ok(Ok(Upstream::Tls(ws))) => pump(ws, &mut outbound, &mut emitter).await,
    }
}

async fn connect(config: &Config, tls: Option<TlsConnector>) -> Result<Upstream> {
    let server = Destination::new(config.server.as_str(), config.port);
    let stream = TcpStream::connect((server.host.as_str(), server.port)).await?;
    stream.set_nodelay(true)?;

    let request = build_request(config)?;
    tracing::debug!("Opening tunnel {} via {}", websocket_url(config), server);

    if !config.uses_tls() {
        let (ws, _) = client_async(request, stream).await?;
        return Ok(Upstream::Plain(ws));
    }

    let connector = match tls {
        Some(connector) => connector,
        None => tls::build_connector(config.allow_untrusted_certificate)?,
    };
    let server_name = tls::server_name(config.sni_host())?;
    let stream = connector
        .connect(server_name, stream)
        .await
        .map_err(|e| Error::tunnel(format!("TLS handshake failed: {}", e)))?;

    let (ws, _) = client_async(request, stream).await?;
    Ok(Upstream::Tls(ws))
}

/// How a pump half finished.
enum PumpEnd {
    /// The `Tunnel` handle went away; nothing left to report
    Detached,
    /// The connection ended; report it
    Closed(Option<Error>),
}

/// Move messages both ways until either side ends.
///
/// The writer and reader halves are polled independently, so a reader
/// waiting on a full event queue never stops outbound messages from
/// draining, and the other way round.
async fn pump<S>(
    ws: WebSocketStream<S>,
    outbound: &mut mpsc::Receiver<Bytes>,
    emitter: &mut EventEmitter,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if !emitter.open().await {
        return;
    }
    let (mut sink, mut stream) = ws.split();

    let write_half = async {
        while let Some(data) = outbound.recv().await {
            if let Err(e) = sink.send(Message::Binary(data.to_vec())).await {
                return PumpEnd::Closed(Some(e.into()));
            }
        }
        let _ = sink.close().await;
        PumpEnd::Detached
    };

    let read_half = async {
        loop {
            let data = match stream.next().await {
                Some(Ok(Message::Binary(data))) => Bytes::from(data),
                Some(Ok(Message::Text(text))) => text_as_bytes(&text),
                Some(Ok(Message::Close(_))) | None => return PumpEnd::Closed(None),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return PumpEnd::Closed(Some(e.into())),
            };
            if !emitter.message(data).await {
                return PumpEnd::Detached;
            }
        }
    };

    let end = tokio::select! {
        end = write_half => end,
        end = read_half => end,
    };

    if let PumpEnd::Closed(cause) = end {
        emitter.close(cause).await;
    }
}

/// Text frames carry binary payload one code point per byte.
fn text_as_bytes(text: &str) -> Bytes {
    text.chars().map(|c| c as u32 as u8).collect::<Vec<u8>>().into()
}
