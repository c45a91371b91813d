//! Connection statistics shared by everything built on one context.

use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics for connection handling
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections opened (accepted or connected)
    pub connections_opened: AtomicU64,
    /// Currently open connections
    pub active_connections: AtomicU64,
    /// Total bytes read from sockets
    pub bytes_read: AtomicU64,
    /// Total bytes written to sockets
    pub bytes_written: AtomicU64,
    /// Connections that hit their idle timeout
    pub idle_timeouts: AtomicU64,
    /// Connections that hit their lifetime timeout
    pub connection_timeouts: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn idle_timeout(&self) {
        self.idle_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_timeout(&self) {
        self.connection_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_close_counts() {
        let stats = ConnectionStats::new();
        stats.connection_opened();
        stats.connection_opened();
        stats.connection_closed();
        assert_eq!(stats.connections_opened.load(Ordering::Relaxed), 2);
        assert_eq!(stats.active(), 1);
    }

    #[test]
    fn test_byte_counters() {
        let stats = ConnectionStats::new();
        stats.bytes_read(10);
        stats.bytes_written(4);
        stats.bytes_written(6);
        assert_eq!(stats.bytes_read.load(Ordering::Relaxed), 10);
        assert_eq!(stats.bytes_written.load(Ordering::Relaxed), 10);
    }
}
