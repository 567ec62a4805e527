//! Counters for sessions, event loops and RPC calls

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::LazyLock;

/// Process-wide counters
#[derive(Debug, Default)]
pub struct NetMetrics {
    /// Total sessions started
    pub connections_created: AtomicU64,
    /// Sessions started and not yet closed
    pub active_connections: AtomicUsize,
    /// Bytes handed to sockets by writers
    pub bytes_sent: AtomicU64,
    /// Messages delivered to message callbacks
    pub messages_received: AtomicU64,
    /// RPC calls issued
    pub rpc_calls: AtomicU64,
    /// RPC calls resolved by their timer
    pub rpc_timeouts: AtomicU64,
}

impl NetMetrics {
    /// Record a started session
    pub fn connection_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a closed session
    pub fn connection_closed(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn bytes_written(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rpc_call(&self) {
        self.rpc_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rpc_timeout(&self) {
        self.rpc_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            rpc_calls: self.rpc_calls.load(Ordering::Relaxed),
            rpc_timeouts: self.rpc_timeouts.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_created: u64,
    pub active_connections: usize,
    pub bytes_sent: u64,
    pub messages_received: u64,
    pub rpc_calls: u64,
    pub rpc_timeouts: u64,
}

impl MetricsSnapshot {
    /// Fraction of RPC calls that ended in a timeout
    pub fn rpc_timeout_rate(&self) -> f64 {
        if self.rpc_calls == 0 {
            0.0
        } else {
            self.rpc_timeouts as f64 / self.rpc_calls as f64
        }
    }
}

/// Counters owned by one event loop
#[derive(Debug, Default)]
pub struct LoopMetrics {
    /// Wake requests issued by `submit`
    pub triggers: AtomicU64,
    /// Wake sentinels observed by the loop
    pub wakeups: AtomicU64,
    /// Tasks executed
    pub tasks_run: AtomicU64,
    /// Readiness events dispatched to connections
    pub events: AtomicU64,
}

impl LoopMetrics {
    pub fn snapshot(&self) -> LoopStats {
        LoopStats {
            triggers: self.triggers.load(Ordering::Relaxed),
            wakeups: self.wakeups.load(Ordering::Relaxed),
            tasks_run: self.tasks_run.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`LoopMetrics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopStats {
    pub triggers: u64,
    pub wakeups: u64,
    pub tasks_run: u64,
    pub events: u64,
}

static GLOBAL_METRICS: LazyLock<NetMetrics> = LazyLock::new(NetMetrics::default);

/// Get global metrics
pub fn global_metrics() -> &'static NetMetrics {
    &GLOBAL_METRICS
}

/// Format metrics for human-readable display
pub fn format_metrics(snapshot: &MetricsSnapshot) -> String {
    format!(
        "dnet Metrics:\n\
         Connections: {} created, {} active\n\
         Traffic: {} bytes sent, {} messages received\n\
         RPC: {} calls, {} timeouts ({:.2}%)",
        snapshot.connections_created,
        snapshot.active_connections,
        snapshot.bytes_sent,
        snapshot.messages_received,
        snapshot.rpc_calls,
        snapshot.rpc_timeouts,
        snapshot.rpc_timeout_rate() * 100.0,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_counters() {
        let metrics = NetMetrics::default();

        metrics.connection_created();
        assert_eq!(metrics.active_connections.load(Ordering::Relaxed), 1);

        metrics.connection_closed();
        metrics.connection_closed();
        assert_eq!(metrics.active_connections.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.connections_created.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_format_metrics() {
        let metrics = NetMetrics::default();
        metrics.rpc_call();
        metrics.rpc_call();
        metrics.rpc_timeout();
        metrics.bytes_written(10);

        let text = format_metrics(&metrics.snapshot());
        assert!(text.contains("2 calls, 1 timeouts (50.00%)"));
        assert!(text.contains("10 bytes sent"));
    }
}
