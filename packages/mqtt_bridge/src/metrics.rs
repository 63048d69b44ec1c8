//! Server metrics for observability
//!
//! Provides runtime counters for monitoring bridge health.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Server-wide metrics
#[derive(Debug, Default)]
pub struct ServerMetrics {
    // Connection metrics
    /// Currently open control channels
    pub active_connections: AtomicU64,
    /// Total control channels since server start
    pub total_connections: AtomicU64,

    // Message metrics
    /// Commands received from browsers
    pub commands_received: AtomicU64,
    /// Commands that produced an error response
    pub command_errors: AtomicU64,
    /// Frames written to browsers
    pub messages_sent: AtomicU64,
    /// Broker messages forwarded to browsers
    pub deliveries_forwarded: AtomicU64,

    // Broker metrics
    pub broker_connects: AtomicU64,
    pub broker_connection_losses: AtomicU64,

    // Error metrics
    /// Control channel read/write failures
    pub websocket_errors: AtomicU64,

    /// Server start time (for uptime calculation)
    start_time: Option<Instant>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    // Connection tracking
    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    // Message tracking
    pub fn command_received(&self) {
        self.commands_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_failed(&self) {
        self.command_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivery_forwarded(&self) {
        self.deliveries_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    // Broker tracking
    pub fn broker_connected(&self) {
        self.broker_connects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn broker_connection_lost(&self) {
        self.broker_connection_losses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn websocket_error(&self) {
        self.websocket_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
            },
            messages: MessageMetrics {
                commands: self.commands_received.load(Ordering::Relaxed),
                command_errors: self.command_errors.load(Ordering::Relaxed),
                sent: self.messages_sent.load(Ordering::Relaxed),
                deliveries: self.deliveries_forwarded.load(Ordering::Relaxed),
            },
            broker: BrokerMetrics {
                connects: self.broker_connects.load(Ordering::Relaxed),
                connection_losses: self.broker_connection_losses.load(Ordering::Relaxed),
            },
            errors: ErrorMetrics {
                websocket: self.websocket_errors.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub messages: MessageMetrics,
    pub broker: BrokerMetrics,
    pub errors: ErrorMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetrics {
    pub commands: u64,
    pub command_errors: u64,
    pub sent: u64,
    pub deliveries: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerMetrics {
    pub connects: u64,
    pub connection_losses: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetrics {
    pub websocket: u64,
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub sessions: SessionHealth,
    pub connections: u64,
    pub uptime_secs: u64,
}

/// Live sessions by broker link state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHealth {
    pub total: u64,
    pub connecting: u64,
    pub connected: u64,
}
