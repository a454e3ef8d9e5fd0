//! Connection identity, lifecycle state and traffic counters.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Generates a new unique connection ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Connection lifecycle.
///
/// States only move forward; `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    /// Not opened yet
    Disconnected,
    /// Transport open, TLS and Hello in progress
    Handshaking,
    /// Our cluster config is sent, waiting for the peer's
    AwaitingClusterConfig,
    /// Ready for index and block traffic
    Connected,
    /// Closed
    Closed,
}

impl ConnectionState {
    /// Returns true once the connection can carry index and block traffic.
    pub fn is_connected(&self) -> bool {
        *self == ConnectionState::Connected
    }

    /// Returns true for the terminal state.
    pub fn is_closed(&self) -> bool {
        *self == ConnectionState::Closed
    }
}

#[derive(Debug)]
struct Counters {
    connected_at: Option<Instant>,
    last_activity: Instant,
    bytes_sent: u64,
    bytes_received: u64,
    messages_sent: u64,
    messages_received: u64,
}

/// Traffic counters of one connection, shared by its reader and writer.
#[derive(Debug)]
pub struct ConnectionStats {
    counters: Mutex<Counters>,
}

/// Point-in-time copy of [`ConnectionStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
    /// Messages sent
    pub messages_sent: u64,
    /// Messages received
    pub messages_received: u64,
}

impl ConnectionStats {
    /// Creates empty counters.
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(Counters {
                connected_at: None,
                last_activity: Instant::now(),
                bytes_sent: 0,
                bytes_received: 0,
                messages_sent: 0,
                messages_received: 0,
            }),
        }
    }

    /// Marks the connection as established.
    pub fn set_connected(&self) {
        let mut c = self.counters.lock();
        c.connected_at = Some(Instant::now());
        c.last_activity = Instant::now();
    }

    /// Records a written frame.
    pub fn record_sent(&self, bytes: u64) {
        let mut c = self.counters.lock();
        c.bytes_sent += bytes;
        c.messages_sent += 1;
        c.last_activity = Instant::now();
    }

    /// Records a read frame.
    pub fn record_received(&self, bytes: u64) {
        let mut c = self.counters.lock();
        c.bytes_received += bytes;
        c.messages_received += 1;
        c.last_activity = Instant::now();
    }

    /// Returns how long the connection has been established.
    pub fn duration(&self) -> Option<Duration> {
        self.counters.lock().connected_at.map(|t| t.elapsed())
    }

    /// Returns the instant of the last successful read or write.
    pub fn last_activity(&self) -> Instant {
        self.counters.lock().last_activity
    }

    /// Returns time since last activity.
    pub fn idle_time(&self) -> Duration {
        self.last_activity().elapsed()
    }

    /// Copies the counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        let c = self.counters.lock();
        StatsSnapshot {
            bytes_sent: c.bytes_sent,
            bytes_received: c.bytes_received,
            messages_sent: c.messages_sent,
            messages_received: c.messages_received,
        }
    }
}

impl Default for ConnectionStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_counting() {
        let stats = ConnectionStats::new();
        assert!(stats.duration().is_none());

        stats.set_connected();
        stats.record_sent(100);
        stats.record_received(200);
        stats.record_received(50);

        let snap = stats.snapshot();
        assert_eq!(snap.bytes_sent, 100);
        assert_eq!(snap.bytes_received, 250);
        assert_eq!(snap.messages_sent, 1);
        assert_eq!(snap.messages_received, 2);
        assert!(stats.duration().is_some());
        assert!(stats.idle_time() < Duration::from_secs(5));
    }

    #[test]
    fn test_connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
        assert!(id1 < id2);
    }

    #[test]
    fn test_state_order() {
        assert!(ConnectionState::Disconnected < ConnectionState::Handshaking);
        assert!(ConnectionState::AwaitingClusterConfig < ConnectionState::Connected);
        assert!(ConnectionState::Closed.is_closed());
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Handshaking.is_connected());
    }
}
