//! Broker client adapter seam.
//!
//! The session bridge only talks to the broker through these two traits, so the
//! MQTT client implementation can be swapped for a scripted one in tests.
//!
//! # Events
//!
//! `BrokerConnector::connect` resolves once the first broker handshake has
//! completed. From then on the returned event receiver yields:
//! - `Connected` every time the adapter re-establishes a dropped connection
//! - `ConnectionLost` every time an established connection drops
//! - `Message` for every publish delivered by the broker
//!
//! The receiver closes when the connection is torn down for good.

use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Highest QoS level understood by the broker protocol.
pub const MAX_QOS: u8 = 2;

/// Options for a single broker connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerOptions {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    /// Username and password, only set when a username was supplied.
    pub credentials: Option<(String, String)>,
    /// Start every connection without server-side session state.
    pub clean_session: bool,
    pub keep_alive: Duration,
    /// Upper bound for the delay between automatic reconnect attempts.
    pub max_reconnect_interval: Duration,
    /// Upper bound for a single acknowledgement wait.
    pub ack_timeout: Duration,
}

/// A message delivered by the broker on one of the session's subscriptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retained: bool,
}

/// Asynchronous notifications from a live broker connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Connected,
    ConnectionLost(String),
    Message(Delivery),
}

pub type BrokerEvents = mpsc::UnboundedReceiver<BrokerEvent>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("{0}")]
    Connection(String),
    #[error("broker rejected the request: {0}")]
    Rejected(String),
    #[error("timed out waiting for broker acknowledgement")]
    Timeout,
    #[error("connection closed")]
    Closed,
}

/// Opens broker connections.
pub trait BrokerConnector: Send + Sync {
    fn connect(
        &self,
        options: BrokerOptions,
    ) -> BoxFuture<'_, Result<(Arc<dyn BrokerHandle>, BrokerEvents), BrokerError>>;
}

/// One live broker connection.
///
/// The request methods resolve when the broker has acknowledged the request.
pub trait BrokerHandle: Send + Sync {
    fn subscribe(&self, topic: String, qos: u8) -> BoxFuture<'_, Result<(), BrokerError>>;

    fn unsubscribe(&self, topic: String) -> BoxFuture<'_, Result<(), BrokerError>>;

    fn publish(
        &self,
        topic: String,
        payload: Vec<u8>,
        qos: u8,
        retain: bool,
    ) -> BoxFuture<'_, Result<(), BrokerError>>;

    /// Graceful shutdown: in-flight I/O gets up to `linger` to flush before the
    /// connection is dropped. Never fails.
    fn disconnect(&self, linger: Duration) -> BoxFuture<'_, ()>;

    fn is_connected(&self) -> bool;
}
