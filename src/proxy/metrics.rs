//! Proxy metrics collection.
//!
//! Aggregate counters only; nothing here identifies a client or a
//! destination. The active-connection count is advisory and never gates
//! admission.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::sink::EventSink;

/// Proxy metrics collector.
pub struct ProxyMetrics {
    /// Listener start time
    start_time: Instant,
    /// Total connections accepted
    total_connections: AtomicU64,
    /// Current active connections
    active_connections: AtomicU64,
    /// Connections classified as SOCKS5
    socks5_connections: AtomicU64,
    /// Connections classified as HTTP
    http_connections: AtomicU64,
    /// Connections whose first byte matched neither protocol
    rejected_connections: AtomicU64,
    /// Bytes sent upstream (client to tunnel, including headers)
    bytes_upstream: AtomicU64,
    /// Bytes delivered to clients (tunnel to client, after header strip)
    bytes_downstream: AtomicU64,
    /// Sessions that ended with an error
    failed_sessions: AtomicU64,
}

impl Default for ProxyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyMetrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            socks5_connections: AtomicU64::new(0),
            http_connections: AtomicU64::new(0),
            rejected_connections: AtomicU64::new(0),
            bytes_upstream: AtomicU64::new(0),
            bytes_downstream: AtomicU64::new(0),
            failed_sessions: AtomicU64::new(0),
        }
    }

    /// Increment total and active connections; returns the new active count.
    pub fn increment_connections(&self) -> u64 {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Decrement active connections; returns the new active count.
    pub fn decrement_connections(&self) -> u64 {
        self.active_connections.fetch_sub(1, Ordering::Relaxed) - 1
    }

    pub fn increment_socks5(&self) {
        self.socks5_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_http(&self) {
        self.http_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_rejected(&self) {
        self.rejected_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_failed(&self) {
        self.failed_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// Add bytes to the upstream counter.
    pub fn add_bytes_upstream(&self, bytes: u64) {
        self.bytes_upstream.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Add bytes to the downstream counter.
    pub fn add_bytes_downstream(&self, bytes: u64) {
        self.bytes_downstream.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Get uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn socks5_connections(&self) -> u64 {
        self.socks5_connections.load(Ordering::Relaxed)
    }

    pub fn http_connections(&self) -> u64 {
        self.http_connections.load(Ordering::Relaxed)
    }

    pub fn rejected_connections(&self) -> u64 {
        self.rejected_connections.load(Ordering::Relaxed)
    }

    pub fn failed_sessions(&self) -> u64 {
        self.failed_sessions.load(Ordering::Relaxed)
    }

    pub fn bytes_upstream(&self) -> u64 {
        self.bytes_upstream.load(Ordering::Relaxed)
    }

    pub fn bytes_downstream(&self) -> u64 {
        self.bytes_downstream.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            total_connections: self.total_connections(),
            active_connections: self.active_connections(),
            socks5_connections: self.socks5_connections(),
            http_connections: self.http_connections(),
            rejected_connections: self.rejected_connections(),
            failed_sessions: self.failed_sessions(),
            bytes_upstream: self.bytes_upstream(),
            bytes_downstream: self.bytes_downstream(),
        }
    }
}

/// Snapshot of proxy metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub total_connections: u64,
    pub active_connections: u64,
    pub socks5_connections: u64,
    pub http_connections: u64,
    pub rejected_connections: u64,
    pub failed_sessions: u64,
    pub bytes_upstream: u64,
    pub bytes_downstream: u64,
}

/// Holds one slot in the active-connection count.
///
/// The slot is given back exactly once: on the first [`release`] call or on
/// drop, whichever comes first.
///
/// [`release`]: ConnectionTicket::release
pub struct ConnectionTicket {
    metrics: Arc<ProxyMetrics>,
    sink: Arc<dyn EventSink>,
    released: AtomicBool,
}

impl ConnectionTicket {
    /// Count a newly accepted connection.
    pub fn acquire(metrics: Arc<ProxyMetrics>, sink: Arc<dyn EventSink>) -> Self {
        let active = metrics.increment_connections();
        sink.connections_changed(active);
        Self {
            metrics,
            sink,
            released: AtomicBool::new(false),
        }
    }

    /// Give the slot back. Later calls do nothing.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let active = self.metrics.decrement_connections();
        self.sink.connections_changed(active);
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for ConnectionTicket {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;

    #[test]
    fn test_metrics_counters() {
        let metrics = ProxyMetrics::new();

        assert_eq!(metrics.increment_connections(), 1);
        assert_eq!(metrics.increment_connections(), 2);
        assert_eq!(metrics.decrement_connections(), 1);
        metrics.increment_socks5();
        metrics.increment_rejected();
        metrics.add_bytes_upstream(100);
        metrics.add_bytes_downstream(250);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_connections, 2);
        assert_eq!(snapshot.active_connections, 1);
        assert_eq!(snapshot.socks5_connections, 1);
        assert_eq!(snapshot.http_connections, 0);
        assert_eq!(snapshot.rejected_connections, 1);
        assert_eq!(snapshot.bytes_upstream, 100);
        assert_eq!(snapshot.bytes_downstream, 250);
    }

    #[test]
    fn test_ticket_releases_once() {
        let metrics = Arc::new(ProxyMetrics::new());
        let sink = MemorySink::new();

        let ticket = ConnectionTicket::acquire(Arc::clone(&metrics), sink.clone());
        assert_eq!(metrics.active_connections(), 1);

        ticket.release();
        ticket.release();
        drop(ticket);

        assert_eq!(metrics.active_connections(), 0);
        assert_eq!(metrics.total_connections(), 1);
        assert_eq!(sink.counts(), vec![1, 0]);
    }
}
