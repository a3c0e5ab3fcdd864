//! # vless-proxy
//!
//! A local SOCKS5 and HTTP proxy that carries every client connection
//! through its own VLESS-over-WebSocket tunnel.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Dispatcher (TCP listener, first-byte protocol sniff)   │
//! ├─────────────────────────────────────────────────────────┤
//! │  Handshakes (SOCKS5 CONNECT, HTTP CONNECT / forward)    │
//! ├─────────────────────────────────────────────────────────┤
//! │  RelaySession (early-data gate, response header strip)  │
//! ├─────────────────────────────────────────────────────────┤
//! │  VLESS codec (request header, address encoding)         │
//! ├─────────────────────────────────────────────────────────┤
//! │  Tunnel (WebSocket over TCP or TLS)                     │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use vless_proxy::{Config, Dispatcher, TracingSink, WsConnector};
//!
//! # async fn run() -> vless_proxy::Result<()> {
//! let config = Arc::new(Config::from_file("proxy.json")?);
//! let connector = Arc::new(WsConnector::new(Arc::clone(&config))?);
//! let dispatcher = Dispatcher::bind(config, connector, Arc::new(TracingSink)).await?;
//! dispatcher.run().await
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod proxy;
pub mod sink;
pub mod tunnel;
pub mod vless;

pub use config::{Config, Security};
pub use error::{Error, Result};
pub use proxy::{Dispatcher, MetricsSnapshot, ProxyMetrics};
pub use sink::{EventSink, MemorySink, TracingSink};
pub use tunnel::{Connect, Tunnel, TunnelEvent, WsConnector};
pub use vless::Destination;

/// VLESS protocol version carried in request headers
pub const PROTOCOL_VERSION: u8 = vless::header::VERSION;

/// Default timeout for the upstream TCP/TLS/WebSocket handshake (seconds)
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 15;
