//! Scripted in-memory broker for session and handler tests.

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::broker::{
    BrokerConnector, BrokerError, BrokerEvent, BrokerEvents, BrokerHandle, BrokerOptions,
};
use crate::ws::ServerMessage;

/// Every adapter call the mock has seen, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerCall {
    Connect(BrokerOptions),
    Subscribe(String, u8),
    Unsubscribe(String),
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: u8,
        retain: bool,
    },
    Disconnect(Duration),
}

#[derive(Default)]
pub struct MockBroker {
    calls: Mutex<Vec<BrokerCall>>,
    connected: AtomicBool,
    events: Mutex<Option<mpsc::UnboundedSender<BrokerEvent>>>,
    fail_connect: Mutex<Option<BrokerError>>,
    fail_unsubscribe: Mutex<Option<BrokerError>>,
    fail_publish: Mutex<Option<BrokerError>>,
    /// Subscriptions to these topics are rejected until cleared.
    rejected_topics: Mutex<HashMap<String, BrokerError>>,
}

impl MockBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connector(self: &Arc<Self>) -> Arc<dyn BrokerConnector> {
        Arc::new(MockConnector {
            broker: self.clone(),
        })
    }

    pub fn calls(&self) -> Vec<BrokerCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn subscribe_calls(&self) -> Vec<(String, u8)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                BrokerCall::Subscribe(topic, qos) => Some((topic, qos)),
                _ => None,
            })
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn fail_next_connect(&self, err: BrokerError) {
        *self.fail_connect.lock().unwrap() = Some(err);
    }

    pub fn fail_next_unsubscribe(&self, err: BrokerError) {
        *self.fail_unsubscribe.lock().unwrap() = Some(err);
    }

    pub fn fail_next_publish(&self, err: BrokerError) {
        *self.fail_publish.lock().unwrap() = Some(err);
    }

    pub fn reject_topic(&self, topic: &str, err: BrokerError) {
        self.rejected_topics
            .lock()
            .unwrap()
            .insert(topic.to_string(), err);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn emit(&self, event: BrokerEvent) {
        if let Some(tx) = self.events.lock().unwrap().as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Simulate the broker dropping the connection.
    pub fn lose_connection(&self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        self.emit(BrokerEvent::ConnectionLost(reason.to_string()));
    }

    /// Simulate the adapter's automatic reconnect succeeding.
    pub fn reconnect(&self) {
        self.connected.store(true, Ordering::SeqCst);
        self.emit(BrokerEvent::Connected);
    }

    pub fn deliver(&self, topic: &str, payload: &[u8], qos: u8, retained: bool) {
        self.emit(BrokerEvent::Message(crate::broker::Delivery {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            retained,
        }));
    }

    fn record(&self, call: BrokerCall) {
        self.calls.lock().unwrap().push(call);
    }

    /// Requests made while the connection is down fail like the real adapter.
    fn require_connection(&self) -> Result<(), BrokerError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(BrokerError::Connection("not connected".to_string()))
        }
    }
}

struct MockConnector {
    broker: Arc<MockBroker>,
}

impl BrokerConnector for MockConnector {
    fn connect(
        &self,
        options: BrokerOptions,
    ) -> BoxFuture<'_, Result<(Arc<dyn BrokerHandle>, BrokerEvents), BrokerError>> {
        Box::pin(async move {
            self.broker.record(BrokerCall::Connect(options));
            if let Some(err) = self.broker.fail_connect.lock().unwrap().take() {
                return Err(err);
            }
            let (tx, rx) = mpsc::unbounded_channel();
            *self.broker.events.lock().unwrap() = Some(tx);
            self.broker.connected.store(true, Ordering::SeqCst);
            let handle: Arc<dyn BrokerHandle> = Arc::new(MockHandle {
                broker: self.broker.clone(),
            });
            Ok((handle, rx))
        })
    }
}

struct MockHandle {
    broker: Arc<MockBroker>,
}

impl BrokerHandle for MockHandle {
    fn subscribe(&self, topic: String, qos: u8) -> BoxFuture<'_, Result<(), BrokerError>> {
        Box::pin(async move {
            self.broker.record(BrokerCall::Subscribe(topic.clone(), qos));
            self.broker.require_connection()?;
            match self.broker.rejected_topics.lock().unwrap().get(&topic) {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            }
        })
    }

    fn unsubscribe(&self, topic: String) -> BoxFuture<'_, Result<(), BrokerError>> {
        Box::pin(async move {
            self.broker.record(BrokerCall::Unsubscribe(topic));
            self.broker.require_connection()?;
            match self.broker.fail_unsubscribe.lock().unwrap().take() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        })
    }

    fn publish(
        &self,
        topic: String,
        payload: Vec<u8>,
        qos: u8,
        retain: bool,
    ) -> BoxFuture<'_, Result<(), BrokerError>> {
        Box::pin(async move {
            self.broker.record(BrokerCall::Publish {
                topic,
                payload,
                qos,
                retain,
            });
            self.broker.require_connection()?;
            match self.broker.fail_publish.lock().unwrap().take() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        })
    }

    fn disconnect(&self, linger: Duration) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.broker.record(BrokerCall::Disconnect(linger));
            self.broker.connected.store(false, Ordering::SeqCst);
            // Dropping the sender ends the session's event pump.
            self.broker.events.lock().unwrap().take();
        })
    }

    fn is_connected(&self) -> bool {
        self.broker.connected.load(Ordering::SeqCst)
    }
}

/// Receive the next outbound message or fail the test after one second.
pub async fn recv(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for outbound message")
        .expect("outbound channel closed")
}

/// Poll `condition` until it holds or one second passes.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within one second"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
