//! Listener and protocol dispatch.
//!
//! Each accepted connection gets its own task. The first byte is peeked,
//! not consumed, so the chosen handshake sees the full stream.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};

use crate::config::Config;
use crate::error::Result;
use crate::proxy::http::HttpHandshake;
use crate::proxy::metrics::{ConnectionTicket, ProxyMetrics};
use crate::proxy::session;
use crate::proxy::socks5::{Socks5Handshake, SOCKS_VERSION};
use crate::proxy::ProxyContext;
use crate::sink::EventSink;
use crate::tunnel::Connect;

/// Client protocol, as told by the first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Socks5,
    Http,
}

/// `0x05` is SOCKS5, an ASCII capital letter starts an HTTP method.
pub fn classify(first_byte: u8) -> Option<Protocol> {
    match first_byte {
        SOCKS_VERSION => Some(Protocol::Socks5),
        b'A'..=b'Z' => Some(Protocol::Http),
        _ => None,
    }
}

/// Accepts local clients and hands them to relay sessions.
pub struct Dispatcher {
    listener: TcpListener,
    ctx: ProxyContext,
}

impl Dispatcher {
    /// Bind to the configured listen address.
    pub async fn bind(
        config: Arc<Config>,
        connector: Arc<dyn Connect>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let listener =
            TcpListener::bind((config.listen_addr.as_str(), config.listen_port)).await?;

        Ok(Self {
            listener,
            ctx: ProxyContext {
                config,
                connector,
                sink,
                metrics: Arc::new(ProxyMetrics::new()),
            },
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn metrics(&self) -> Arc<ProxyMetrics> {
        Arc::clone(&self.ctx.metrics)
    }

    /// Accept connections forever.
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Accept connections until `signal` resolves.
    ///
    /// Sessions already running are left to finish on their own.
    pub async fn run_until<F>(self, signal: F) -> Result<()>
    where
        F: Future,
    {
        tracing::info!("Proxy listening on {}", self.local_addr()?);
        tokio::pin!(signal);

        loop {
            tokio::select! {
                _ = &mut signal => {
                    tracing::info!("Shutting down listener");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => self.spawn_connection(stream, peer_addr),
                    Err(e) => {
                        tracing::warn!("Accept error: {}", e);
                    }
                },
            }
        }
    }

    fn spawn_connection(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let ctx = self.ctx.clone();

        tokio::spawn(async move {
            let ticket = ConnectionTicket::acquire(Arc::clone(&ctx.metrics), Arc::clone(&ctx.sink));
            let sink = Arc::clone(&ctx.sink);

            if let Err(e) = Self::handle_connection(ctx, stream, ticket).await {
                tracing::debug!("Connection error from {}: {}", peer_addr, e);
                sink.log(&format!("Connection from {} failed: {}", peer_addr, e));
            }
        });
    }

    async fn handle_connection(
        ctx: ProxyContext,
        stream: TcpStream,
        ticket: ConnectionTicket,
    ) -> Result<()> {
        stream.set_nodelay(true)?;

        let mut first = [0u8; 1];
        if stream.peek(&mut first).await? == 0 {
            return Ok(());
        }

        match classify(first[0]) {
            Some(Protocol::Socks5) => {
                ctx.metrics.increment_socks5();
                session::serve(stream, Socks5Handshake::new(), ctx, ticket).await
            }
            Some(Protocol::Http) => {
                ctx.metrics.increment_http();
                session::serve(stream, HttpHandshake::new(), ctx, ticket).await
            }
            None => {
                ctx.metrics.increment_rejected();
                tracing::debug!("Rejected connection with first byte {:#04x}", first[0]);
                Ok(())
            }
        }
    }
}
