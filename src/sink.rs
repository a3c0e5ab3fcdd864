//! Notifications for whoever embeds the proxy.
//!
//! A host application (status window, tray icon, test harness) receives a
//! human-readable log line per notable connection event and the current
//! number of active connections. Both calls are fire-and-forget.

use std::sync::Arc;

use parking_lot::Mutex;

/// Receiver for proxy notifications.
///
/// Implementations must not block; they are called from connection tasks.
pub trait EventSink: Send + Sync {
    /// A short human-readable message.
    fn log(&self, message: &str);

    /// The number of active client connections changed.
    fn connections_changed(&self, active: u64);
}

/// Default sink: forwards everything to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn log(&self, message: &str) {
        tracing::info!("{}", message);
    }

    fn connections_changed(&self, active: u64) {
        tracing::debug!("Active connections: {}", active);
    }
}

/// Sink that keeps every notification in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    logs: Mutex<Vec<String>>,
    counts: Mutex<Vec<u64>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Log messages received so far.
    pub fn logs(&self) -> Vec<String> {
        self.logs.lock().clone()
    }

    /// Every active-connection count reported so far, in order.
    pub fn counts(&self) -> Vec<u64> {
        self.counts.lock().clone()
    }
}

impl EventSink for MemorySink {
    fn log(&self, message: &str) {
        self.logs.lock().push(message.to_string());
    }

    fn connections_changed(&self, active: u64) {
        self.counts.lock().push(active);
    }
}
