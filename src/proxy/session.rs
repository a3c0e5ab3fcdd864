//! Relay session: one client connection bound to one tunnel.
//!
//! ```text
//! HandshakePending ──Open──▶ Relaying ──EOF / error / Closed──▶ Closed
//!        │                                                    ▲
//!        └────────────────────── client EOF / error ──────────┘
//! ```
//!
//! While the tunnel handshake is in flight, client bytes are parked in the
//! [`UpstreamGate`]. On `Open` the VLESS header, the handler's initial bytes
//! and the parked chunks leave as a single message. Afterwards chunks go
//! straight through the same gate. Upload and download are pumped as two
//! independent halves.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::proxy::metrics::{ConnectionTicket, ProxyMetrics};
use crate::proxy::{Handshake, Negotiated, ProxyContext};
use crate::tunnel::{Tunnel, TunnelEvent, TunnelSender};
use crate::vless::{build_request_header, Destination, ResponseStripper};

/// Read buffer size for client sockets.
pub const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Client bytes held before the tunnel opens; reading pauses beyond this.
pub const MAX_EARLY_DATA: usize = 512 * 1024;

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    HandshakePending,
    Relaying,
    Closed,
}

/// Orders client bytes relative to the request header.
///
/// Every client chunk passes through [`push`](UpstreamGate::push). Before the
/// gate opens chunks are queued; [`open`](UpstreamGate::open) releases
/// `header + initial + queued` exactly once.
#[derive(Debug, Default)]
pub struct UpstreamGate {
    initial: Bytes,
    pending: Vec<Bytes>,
    ready: bool,
}

impl UpstreamGate {
    /// A closed gate; `initial` goes right after the header.
    pub fn new(initial: Bytes) -> Self {
        Self {
            initial,
            pending: Vec::new(),
            ready: false,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Whether more early data should wait for the gate to open.
    pub fn is_full(&self) -> bool {
        !self.ready && self.pending_len() >= MAX_EARLY_DATA
    }

    /// Number of bytes waiting for the gate to open.
    pub fn pending_len(&self) -> usize {
        self.initial.len() + self.pending.iter().map(Bytes::len).sum::<usize>()
    }

    /// Returns the chunk if it may be sent now, otherwise queues it.
    pub fn push(&mut self, chunk: Bytes) -> Option<Bytes> {
        if self.ready {
            Some(chunk)
        } else {
            self.pending.push(chunk);
            None
        }
    }

    /// Open the gate, returning the first upstream message. `None` if already open.
    pub fn open(&mut self, header: Bytes) -> Option<Bytes> {
        if self.ready {
            return None;
        }
        self.ready = true;

        let mut first = BytesMut::with_capacity(header.len() + self.pending_len());
        first.extend_from_slice(&header);
        first.extend_from_slice(&std::mem::take(&mut self.initial));
        for chunk in self.pending.drain(..) {
            first.extend_from_slice(&chunk);
        }
        Some(first.freeze())
    }
}

/// Relay state for one negotiated client connection.
pub struct RelaySession {
    ctx: ProxyContext,
    destination: Destination,
    state: SessionState,
    gate: Arc<Mutex<UpstreamGate>>,
    opened: Arc<Notify>,
    stripper: ResponseStripper,
    tunnel: Tunnel,
    ticket: ConnectionTicket,
}

impl RelaySession {
    pub fn new(
        ctx: ProxyContext,
        negotiated: Negotiated,
        tunnel: Tunnel,
        ticket: ConnectionTicket,
    ) -> Self {
        Self {
            ctx,
            destination: negotiated.destination,
            state: SessionState::HandshakePending,
            gate: Arc::new(Mutex::new(UpstreamGate::new(negotiated.initial_data))),
            opened: Arc::new(Notify::new()),
            stripper: ResponseStripper::new(),
            tunnel,
            ticket,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Pump bytes until either side closes, then tear down.
    ///
    /// The two directions run independently: a stalled upload never holds
    /// up tunnel events, and a slow client never holds up the upload.
    pub async fn run<R, W>(&mut self, mut reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let upstream = pump_upstream(
            &mut reader,
            self.tunnel.sender(),
            Arc::clone(&self.gate),
            Arc::clone(&self.opened),
            Arc::clone(&self.ctx.metrics),
        );

        // The upstream half wins ties so that bytes already readable are
        // gated before a pending Open is handled.
        let mut outcome = tokio::select! {
            biased;
            result = upstream => result,
            result = self.pump_downstream(&mut writer) => result,
        };

        // A failed send only says the tunnel is gone; the transport may have
        // queued the reason.
        if matches!(&outcome, Err(e) if e.is_tunnel_error()) {
            if let Some(cause) = self.tunnel.pending_close_error() {
                outcome = Err(cause);
            }
        }

        self.close(outcome.as_ref().err());
        let _ = writer.shutdown().await;
        outcome
    }

    async fn pump_downstream<W>(&mut self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        loop {
            match self.tunnel.next_event().await {
                Some(TunnelEvent::Open) => self.on_tunnel_open().await?,
                Some(TunnelEvent::Message(data)) => {
                    if let Some(payload) = self.stripper.process(data) {
                        writer.write_all(&payload).await?;
                        self.ctx.metrics.add_bytes_downstream(payload.len() as u64);
                    }
                }
                Some(TunnelEvent::Closed(error)) => return error.map_or(Ok(()), Err),
                None => return Err(Error::tunnel("tunnel ended without close")),
            }
        }
    }

    async fn on_tunnel_open(&mut self) -> Result<()> {
        let header = build_request_header(&self.ctx.config.identifier, &self.destination)?;
        let permit = self.tunnel.reserve().await?;
        if let Some(first) = self.gate.lock().open(header) {
            self.ctx.metrics.add_bytes_upstream(first.len() as u64);
            permit.send(first);
        }
        self.opened.notify_one();
        self.state = SessionState::Relaying;
        tracing::debug!("Tunnel open for {}", self.destination);
        Ok(())
    }

    /// Tear the session down. Only the first call has any effect.
    pub fn close(&mut self, error: Option<&Error>) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;
        self.tunnel.close();

        match error {
            Some(e) => {
                self.ctx.metrics.increment_failed();
                self.ctx
                    .sink
                    .log(&format!("{} closed with error: {}", self.destination, e));
            }
            None => tracing::debug!("{} closed", self.destination),
        }
        self.ticket.release();
    }
}

/// Client to tunnel. Every chunk goes through the gate while a permit is
/// held, so nothing can slip in ahead of the first message.
async fn pump_upstream<R>(
    reader: &mut R,
    sender: TunnelSender,
    gate: Arc<Mutex<UpstreamGate>>,
    opened: Arc<Notify>,
    metrics: Arc<ProxyMetrics>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let full = gate.lock().is_full();
        if full {
            opened.notified().await;
        }

        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        let permit = sender.reserve().await?;
        if let Some(chunk) = gate.lock().push(Bytes::copy_from_slice(&buf[..n])) {
            metrics.add_bytes_upstream(chunk.len() as u64);
            permit.send(chunk);
        }
    }
}

/// Run a client connection from its first byte to teardown.
///
/// Handshake failures are returned to the caller; failures after the
/// destination is known are reported through the session's sink.
pub async fn serve<S, H>(
    client: S,
    mut handshake: H,
    ctx: ProxyContext,
    ticket: ConnectionTicket,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    H: Handshake,
{
    let (mut reader, mut writer) = tokio::io::split(client);
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];

    let negotiated = 'negotiate: loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        let mut progress = handshake.feed(&buf[..n])?;
        loop {
            for reply in &progress.replies {
                writer.write_all(reply).await?;
            }
            if let Some(negotiated) = progress.negotiated {
                break 'negotiate negotiated;
            }
            if progress.replies.is_empty() {
                break;
            }
            progress = handshake.replies_flushed()?;
        }
    };
    drop(buf);

    ctx.sink.log(&format!("Connecting {}", negotiated.destination));
    let tunnel = ctx.connector.open(&negotiated.destination);
    let mut session = RelaySession::new(ctx, negotiated, tunnel, ticket);
    // Errors are already reported by the session itself.
    let _ = session.run(reader, writer).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;

    use super::*;
    use crate::config::Config;
    use crate::proxy::http::HttpHandshake;
    use crate::proxy::metrics::ProxyMetrics;
    use crate::proxy::socks5::Socks5Handshake;
    use crate::sink::MemorySink;
    use crate::tunnel::Connect;
    use crate::vless::RequestHeader;

    const ID: &str = "b831381d-6324-4d53-ad4f-8cda48b30811";

    /// Greeting and CONNECT 127.0.0.1:80 in one write.
    const SOCKS5_CONNECT: [u8; 13] = [
        0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x01, 0x7f, 0x00, 0x00, 0x01, 0x00, 0x50,
    ];

    /// Upstream end of a fake tunnel.
    struct FakeRemote {
        destination: Destination,
        sent: mpsc::Receiver<Bytes>,
        events: mpsc::Sender<TunnelEvent>,
    }

    struct FakeConnector {
        remotes: mpsc::UnboundedSender<FakeRemote>,
    }

    impl Connect for FakeConnector {
        fn open(&self, destination: &Destination) -> Tunnel {
            let (out_tx, out_rx) = mpsc::channel(64);
            let (event_tx, event_rx) = mpsc::channel(64);
            let _ = self.remotes.send(FakeRemote {
                destination: destination.clone(),
                sent: out_rx,
                events: event_tx,
            });
            Tunnel::new(out_tx, event_rx, None)
        }
    }

    struct Harness {
        ctx: ProxyContext,
        sink: Arc<MemorySink>,
        remotes: mpsc::UnboundedReceiver<FakeRemote>,
    }

    fn harness() -> Harness {
        let (tx, remotes) = mpsc::unbounded_channel();
        let sink = MemorySink::new();
        let ctx = ProxyContext {
            config: Arc::new(Config::new(ID, "edge.example.com", 443)),
            connector: Arc::new(FakeConnector { remotes: tx }),
            sink: sink.clone(),
            metrics: Arc::new(ProxyMetrics::new()),
        };
        Harness { ctx, sink, remotes }
    }

    fn spawn_serve<H: Handshake + Send + 'static>(
        ctx: &ProxyContext,
        handshake: H,
    ) -> (DuplexStream, tokio::task::JoinHandle<Result<()>>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let ticket = ConnectionTicket::acquire(Arc::clone(&ctx.metrics), ctx.sink.clone());
        let task = tokio::spawn(serve(server, handshake, ctx.clone(), ticket));
        (client, task)
    }

    async fn read_n(client: &mut DuplexStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        client.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[test]
    fn test_gate_orders_header_initial_and_early_data() {
        let mut gate = UpstreamGate::new(Bytes::from_static(b"init|"));
        assert_eq!(gate.push(Bytes::from_static(b"a|")), None);
        assert_eq!(gate.push(Bytes::from_static(b"b")), None);
        assert_eq!(gate.pending_len(), 8);

        let first = gate.open(Bytes::from_static(b"HDR|")).unwrap();
        assert_eq!(&first[..], b"HDR|init|a|b");
        assert!(gate.is_ready());
        assert_eq!(gate.pending_len(), 0);

        assert!(!gate.is_full());
        assert_eq!(gate.open(Bytes::from_static(b"HDR|")), None);
        assert_eq!(
            gate.push(Bytes::from_static(b"c")),
            Some(Bytes::from_static(b"c"))
        );
    }

    #[test]
    fn test_gate_fills_only_while_closed() {
        let mut gate = UpstreamGate::new(Bytes::new());
        while !gate.is_full() {
            assert_eq!(gate.push(Bytes::from(vec![0u8; RELAY_BUFFER_SIZE])), None);
        }
        assert_eq!(gate.pending_len(), MAX_EARLY_DATA);

        let first = gate.open(Bytes::from_static(b"H")).unwrap();
        assert_eq!(first.len(), 1 + MAX_EARLY_DATA);
        assert!(!gate.is_full());
    }

    #[tokio::test]
    async fn test_socks5_session_end_to_end() {
        let mut h = harness();
        let (mut client, task) = spawn_serve(&h.ctx, Socks5Handshake::new());

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        assert_eq!(read_n(&mut client, 2).await, vec![0x05, 0x00]);

        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 0x7f, 0x00, 0x00, 0x01, 0x00, 0x50])
            .await
            .unwrap();
        assert_eq!(
            read_n(&mut client, 10).await,
            vec![0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
        );

        let mut remote = h.remotes.recv().await.unwrap();
        assert_eq!(remote.destination, Destination::new("127.0.0.1", 80));

        // Early data, written before the tunnel reports ready.
        client.write_all(b"early-1|").await.unwrap();
        client.write_all(b"early-2").await.unwrap();
        remote.events.send(TunnelEvent::Open).await.unwrap();

        let first = remote.sent.recv().await.unwrap();
        let (header, used) = RequestHeader::decode(&first).unwrap();
        assert_eq!(header.destination, Destination::new("127.0.0.1", 80));
        assert_eq!(header.identifier.to_string(), ID);
        assert_eq!(&first[used..], b"early-1|early-2");

        client.write_all(b"later").await.unwrap();
        assert_eq!(&remote.sent.recv().await.unwrap()[..], b"later");

        remote
            .events
            .send(TunnelEvent::Message(Bytes::from_static(&[0x00, 0x00])))
            .await
            .unwrap();
        remote
            .events
            .send(TunnelEvent::Message(Bytes::from_static(b"hello")))
            .await
            .unwrap();
        assert_eq!(read_n(&mut client, 5).await, b"hello".to_vec());

        remote
            .events
            .send(TunnelEvent::Message(Bytes::from_static(b"world")))
            .await
            .unwrap();
        assert_eq!(read_n(&mut client, 5).await, b"world".to_vec());

        remote.events.send(TunnelEvent::Closed(None)).await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        task.await.unwrap().unwrap();
        assert_eq!(h.ctx.metrics.active_connections(), 0);
        assert_eq!(h.sink.logs(), vec!["Connecting 127.0.0.1:80".to_string()]);
    }

    #[tokio::test]
    async fn test_http_connect_session() {
        let mut h = harness();
        let (mut client, task) = spawn_serve(&h.ctx, HttpHandshake::new());

        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let reply = read_n(&mut client, 39).await;
        assert_eq!(reply, b"HTTP/1.1 200 Connection Established\r\n\r\n".to_vec());

        let mut remote = h.remotes.recv().await.unwrap();
        assert_eq!(remote.destination, Destination::new("example.com", 443));

        remote.events.send(TunnelEvent::Open).await.unwrap();
        let first = remote.sent.recv().await.unwrap();
        let (_, used) = RequestHeader::decode(&first).unwrap();
        assert_eq!(used, first.len());

        drop(client);
        task.await.unwrap().unwrap();
        assert_eq!(h.ctx.metrics.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_plain_http_request_is_initial_data() {
        let mut h = harness();
        let (mut client, task) = spawn_serve(&h.ctx, HttpHandshake::new());

        client
            .write_all(
                b"GET http://example.com/a?b=1 HTTP/1.1\r\nHost: example.com\r\nProxy-Connection: keep-alive\r\n\r\n",
            )
            .await
            .unwrap();

        let mut remote = h.remotes.recv().await.unwrap();
        assert_eq!(remote.destination, Destination::new("example.com", 80));
        remote.events.send(TunnelEvent::Open).await.unwrap();

        let first = remote.sent.recv().await.unwrap();
        let (_, used) = RequestHeader::decode(&first).unwrap();
        assert_eq!(
            &first[used..],
            b"GET /a?b=1 HTTP/1.1\r\nHost: example.com\r\n\r\n"
        );

        remote
            .events
            .send(TunnelEvent::Closed(Some(Error::tunnel("reset"))))
            .await
            .unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(h.ctx.metrics.failed_sessions(), 1);
        assert!(h.sink.logs()[1].contains("example.com:80 closed with error"));
    }

    #[tokio::test]
    async fn test_handshake_failure_closes_client() {
        let h = harness();
        let (mut client, task) = spawn_serve(&h.ctx, Socks5Handshake::new());

        client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ProtocolMismatch { .. }));

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert_eq!(h.ctx.metrics.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_close_twice_is_noop() {
        let mut h = harness();
        let tunnel = h.ctx.connector.open(&Destination::new("example.com", 443));
        let _remote = h.remotes.recv().await.unwrap();
        let ticket = ConnectionTicket::acquire(Arc::clone(&h.ctx.metrics), h.ctx.sink.clone());

        let negotiated = Negotiated {
            destination: Destination::new("example.com", 443),
            initial_data: Bytes::new(),
        };
        let mut session = RelaySession::new(h.ctx.clone(), negotiated, tunnel, ticket);

        session.close(Some(&Error::tunnel("reset")));
        session.close(None);

        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(h.sink.logs().len(), 1);
        assert_eq!(h.sink.counts(), vec![1, 0]);
        assert_eq!(h.ctx.metrics.active_connections(), 0);
        assert_eq!(h.ctx.metrics.failed_sessions(), 1);
    }

    #[tokio::test]
    async fn test_download_flows_while_upload_is_stalled() {
        let mut h = harness();
        let (client, task) = spawn_serve(&h.ctx, Socks5Handshake::new());
        let (mut rd, mut wr) = tokio::io::split(client);

        wr.write_all(&SOCKS5_CONNECT).await.unwrap();
        let mut replies = [0u8; 12];
        rd.read_exact(&mut replies).await.unwrap();

        // `sent` is never drained, so the outbound queue fills up.
        let FakeRemote { sent, events, .. } = h.remotes.recv().await.unwrap();
        events.send(TunnelEvent::Open).await.unwrap();

        let uploader = tokio::spawn(async move {
            let chunk = vec![0xa5u8; 16 * 1024];
            while wr.write_all(&chunk).await.is_ok() {}
        });
        let downloader = tokio::spawn(async move {
            events
                .send(TunnelEvent::Message(Bytes::from_static(&[0x00, 0x00])))
                .await
                .unwrap();
            for _ in 0..256 {
                events
                    .send(TunnelEvent::Message(Bytes::from(vec![0x5au8; 1024])))
                    .await
                    .unwrap();
            }
            events
        });

        let mut received = vec![0u8; 256 * 1024];
        tokio::time::timeout(
            std::time::Duration::from_secs(10),
            rd.read_exact(&mut received),
        )
        .await
        .expect("download stalled behind the upload")
        .unwrap();
        assert!(received.iter().all(|b| *b == 0x5a));

        let events = downloader.await.unwrap();
        events.send(TunnelEvent::Closed(None)).await.unwrap();
        task.await.unwrap().unwrap();

        uploader.abort();
        drop(sent);
    }

    #[tokio::test]
    async fn test_send_failure_reports_transport_cause() {
        let mut h = harness();
        let (mut client, task) = spawn_serve(&h.ctx, Socks5Handshake::new());

        client.write_all(&SOCKS5_CONNECT).await.unwrap();
        read_n(&mut client, 12).await;

        let mut remote = h.remotes.recv().await.unwrap();
        remote.events.send(TunnelEvent::Open).await.unwrap();
        remote.sent.recv().await.unwrap();

        // The transport is gone and has queued why.
        let FakeRemote { sent, events, .. } = remote;
        drop(sent);
        events
            .send(TunnelEvent::Closed(Some(Error::tunnel("connection reset by peer"))))
            .await
            .unwrap();
        client.write_all(b"more").await.unwrap();

        task.await.unwrap().unwrap();
        let logs = h.sink.logs();
        assert_eq!(logs.len(), 2, "{:?}", logs);
        assert_eq!(
            logs[1],
            "127.0.0.1:80 closed with error: tunnel error: connection reset by peer"
        );
        assert_eq!(h.ctx.metrics.failed_sessions(), 1);
    }
}
