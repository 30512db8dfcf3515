//! Connection state and statistics.

use crate::types::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Lifecycle state of a managed connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Reconnect attempts exhausted. Only a fresh subscribe restarts the
    /// connection cycle.
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Point-in-time snapshot of one managed connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub instance_name: String,
    pub state: ConnectionState,
    /// When the current connection was established; `None` unless connected.
    pub connected_since: Option<Timestamp>,
    /// Changes that matched at least one subscriber handler.
    pub events_received: u64,
    /// Handler invocations that failed.
    pub events_failed: u64,
    /// Successful re-establishments after a lost connection.
    pub reconnections: u64,
    pub subscriber_count: usize,
}

impl ConnectionStats {
    /// Time since the current connection was established.
    pub fn uptime(&self) -> Duration {
        self.connected_since
            .map(|since| since.elapsed())
            .unwrap_or_default()
    }
}

impl fmt::Display for ConnectionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Instance: {}, State: {}, Uptime: {}s, Events: {}/{}, Reconnects: {}, Subscribers: {}",
            self.instance_name,
            self.state,
            self.uptime().as_secs(),
            self.events_received,
            self.events_failed,
            self.reconnections,
            self.subscriber_count
        )
    }
}

/// Monotonic counters; readable without locks.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub events_received: AtomicU64,
    pub events_failed: AtomicU64,
    pub reconnections: AtomicU64,
}

impl Counters {
    pub fn record_delivery(&self, failed: usize) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
        if failed > 0 {
            self.events_failed.fetch_add(failed as u64, Ordering::Relaxed);
        }
    }

    pub fn record_reconnection(&self) {
        self.reconnections.fetch_add(1, Ordering::Relaxed);
    }
}
