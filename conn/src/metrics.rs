//! Metrics shared by every connection created with the same [Metrics].

use prometheus_client::metrics::{counter::Counter, gauge::Gauge};

/// Metrics for [Connection](crate::Connection) and [SecureConnection](crate::SecureConnection).
#[derive(Default, Clone)]
pub struct Metrics {
    /// Number of forwarder tasks currently running
    pub workers_running: Gauge,

    /// Number of connections wrapped
    pub connections_opened: Counter,

    /// Number of messages written to the transport
    pub messages_sent: Counter,

    /// Number of messages read from the transport
    pub messages_received: Counter,

    /// Number of handshakes that failed
    pub handshakes_failed: Counter,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given context.
    pub fn init<E: commonware_runtime::Metrics>(context: &E) -> Self {
        let metrics = Self::default();
        context.register(
            "workers_running",
            "Number of forwarder tasks currently running",
            metrics.workers_running.clone(),
        );
        context.register(
            "connections_opened",
            "Number of connections wrapped",
            metrics.connections_opened.clone(),
        );
        context.register(
            "messages_sent",
            "Number of messages written to the transport",
            metrics.messages_sent.clone(),
        );
        context.register(
            "messages_received",
            "Number of messages read from the transport",
            metrics.messages_received.clone(),
        );
        context.register(
            "handshakes_failed",
            "Number of handshakes that failed",
            metrics.handshakes_failed.clone(),
        );
        metrics
    }
}

/// Tracks a running forwarder in [Metrics::workers_running] until dropped.
pub(crate) struct Worker {
    running: Gauge,
}

impl Worker {
    pub(crate) fn new(running: &Gauge) -> Self {
        running.inc();
        Self {
            running: running.clone(),
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.running.dec();
    }
}
