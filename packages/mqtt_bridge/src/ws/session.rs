//! Browser Session
//!
//! One session per control channel. Owns the broker link and the subscription
//! intent, and implements the command state machine.
//!
//! All commands and the reconnect replay run under the session lock, so a
//! replay never interleaves with a user subscribe/unsubscribe. Broker
//! deliveries never take the lock; they only write to the outbound channel,
//! which is drained by a single writer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::{
    BrokerConnector, BrokerEvent, BrokerEvents, BrokerHandle, BrokerOptions, Delivery, MAX_QOS,
};
use crate::config::SessionConfig;
use crate::error::{
    BridgeError, CONNECTION_LOST, DISCONNECT_NOT_CONNECTED, EMPTY_BROKER, EMPTY_PUBLISH_TOPIC,
    EMPTY_SUBSCRIBE_TOPIC, EMPTY_UNSUBSCRIBE_TOPIC, INVALID_PORT, INVALID_QOS, NOT_CONNECTED,
};
use crate::metrics::ServerMetrics;

use super::protocol::{
    ConnectConfig, DeliveredMessage, PublishRequest, ResponseType, ServerMessage,
    SubscribeRequest,
};

pub type SessionId = String;

/// Logical connection state as requested by the browser.
///
/// A session stays `Connected` while the adapter is reconnecting after a
/// transient broker loss. Commands issued in that window still reach the
/// adapter and fail with its error (`订阅失败: ...`), not with "not connected".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Writes to the session's control channel.
#[derive(Clone)]
pub(crate) struct Outbound {
    session_id: SessionId,
    tx: mpsc::Sender<ServerMessage>,
    metrics: Option<Arc<ServerMetrics>>,
}

impl Outbound {
    async fn send(&self, msg: ServerMessage) {
        if self.tx.send(msg).await.is_err() {
            debug!(session = %self.session_id, "Outbound channel closed, dropping message");
        }
    }

    async fn deliver(&self, delivery: Delivery) {
        let message = DeliveredMessage::from_delivery(delivery, chrono::Utc::now());
        if let Some(ref m) = self.metrics {
            m.delivery_forwarded();
        }
        self.send(ServerMessage::delivery(&message)).await;
    }
}

struct BrokerLink {
    handle: Arc<dyn BrokerHandle>,
    /// Routes asynchronous broker events for this link.
    pump: JoinHandle<()>,
}

#[derive(Default)]
struct SessionInner {
    link: Option<BrokerLink>,
    /// Topic filter → QoS. Replayed after every (re)connect.
    subscriptions: HashMap<String, u8>,
}

impl SessionInner {
    /// Handle of the current link, including one the adapter is reconnecting.
    fn link_handle(&self) -> Option<Arc<dyn BrokerHandle>> {
        self.link.as_ref().map(|link| link.handle.clone())
    }
}

pub struct Session {
    id: SessionId,
    out: Outbound,
    inner: Arc<Mutex<SessionInner>>,
    state: StdMutex<SessionState>,
    connector: Arc<dyn BrokerConnector>,
    config: SessionConfig,
}

impl Session {
    pub fn new(
        id: SessionId,
        tx: mpsc::Sender<ServerMessage>,
        connector: Arc<dyn BrokerConnector>,
        config: SessionConfig,
        metrics: Option<Arc<ServerMetrics>>,
    ) -> Self {
        Self {
            out: Outbound {
                session_id: id.clone(),
                tx,
                metrics,
            },
            id,
            inner: Arc::new(Mutex::new(SessionInner::default())),
            state: StdMutex::new(SessionState::Disconnected),
            connector,
            config,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        match self.state.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_state(&self, state: SessionState) {
        match self.state.lock() {
            Ok(mut guard) => *guard = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
    }

    /// Snapshot of the recorded subscriptions.
    #[cfg(test)]
    pub async fn subscriptions(&self) -> HashMap<String, u8> {
        self.inner.lock().await.subscriptions.clone()
    }

    /// Send an error response for a failed command.
    pub(crate) async fn send_error(&self, err: &BridgeError) {
        if let Some(ref m) = self.out.metrics {
            m.command_failed();
        }
        self.out.send(err.to_response()).await;
    }

    fn broker_options(&self, config: &ConnectConfig) -> Result<BrokerOptions, BridgeError> {
        let port = if config.port.trim().is_empty() {
            self.config.default_broker_port
        } else {
            match config.port.trim().parse::<u16>() {
                Ok(port) if port != 0 => port,
                _ => return Err(BridgeError::Validation(INVALID_PORT)),
            }
        };

        let client_id = if config.client_id.is_empty() {
            let generated = uuid::Uuid::new_v4().simple().to_string();
            format!("web-mqtt-{}", &generated[..12])
        } else {
            config.client_id.clone()
        };

        let credentials = if config.username.is_empty() {
            None
        } else {
            Some((config.username.clone(), config.password.clone()))
        };

        Ok(BrokerOptions {
            host: config.broker.clone(),
            port,
            client_id,
            credentials,
            clean_session: true,
            keep_alive: self.config.keep_alive,
            max_reconnect_interval: self.config.max_reconnect_interval,
            ack_timeout: self.config.ack_timeout,
        })
    }

    /// Best-effort shutdown of a broker link.
    async fn teardown(&self, link: BrokerLink) {
        link.pump.abort();
        link.handle.disconnect(self.config.disconnect_linger).await;
    }

    pub async fn connect(&self, config: ConnectConfig) -> Result<(), BridgeError> {
        if config.broker.is_empty() {
            return Err(BridgeError::Validation(EMPTY_BROKER));
        }
        let options = self.broker_options(&config)?;

        let mut inner = self.inner.lock().await;
        if let Some(link) = inner.link.take() {
            debug!(session = %self.id, "Replacing existing broker connection");
            self.teardown(link).await;
        }

        self.set_state(SessionState::Connecting);
        info!(
            session = %self.id,
            broker = %format!("{}:{}", options.host, options.port),
            client_id = %options.client_id,
            "Connecting to MQTT broker"
        );

        let (handle, events) = match self.connector.connect(options).await {
            Ok(connected) => connected,
            Err(e) => {
                warn!(session = %self.id, "MQTT connect failed: {}", e);
                self.set_state(SessionState::Disconnected);
                return Err(BridgeError::Connect(e));
            }
        };

        let pump = tokio::spawn(run_event_pump(
            events,
            Arc::downgrade(&self.inner),
            self.out.clone(),
        ));
        inner.link = Some(BrokerLink { handle, pump });
        self.set_state(SessionState::Connected);

        on_connected(&self.out, &inner).await;
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), BridgeError> {
        let mut inner = self.inner.lock().await;
        let Some(link) = inner.link.take() else {
            return Err(BridgeError::NotConnected(DISCONNECT_NOT_CONNECTED));
        };
        self.teardown(link).await;
        self.set_state(SessionState::Disconnected);
        info!(session = %self.id, "Disconnected from MQTT broker");

        self.out
            .send(ServerMessage::success(ResponseType::Disconnect))
            .await;
        Ok(())
    }

    pub async fn subscribe(&self, request: SubscribeRequest) -> Result<(), BridgeError> {
        let mut inner = self.inner.lock().await;
        let handle = inner
            .link_handle()
            .ok_or(BridgeError::NotConnected(NOT_CONNECTED))?;
        if request.topic.is_empty() {
            return Err(BridgeError::Validation(EMPTY_SUBSCRIBE_TOPIC));
        }
        if request.qos > MAX_QOS {
            return Err(BridgeError::Validation(INVALID_QOS));
        }

        handle
            .subscribe(request.topic.clone(), request.qos)
            .await
            .map_err(BridgeError::Subscribe)?;
        inner
            .subscriptions
            .insert(request.topic.clone(), request.qos);
        debug!(session = %self.id, topic = %request.topic, qos = request.qos, "Subscribed");

        self.out
            .send(ServerMessage::success_with(
                ResponseType::Subscribe,
                &request,
            ))
            .await;
        Ok(())
    }

    pub async fn unsubscribe(&self, topic: String) -> Result<(), BridgeError> {
        let mut inner = self.inner.lock().await;
        let handle = inner
            .link_handle()
            .ok_or(BridgeError::NotConnected(NOT_CONNECTED))?;
        if topic.is_empty() {
            return Err(BridgeError::Validation(EMPTY_UNSUBSCRIBE_TOPIC));
        }

        handle
            .unsubscribe(topic.clone())
            .await
            .map_err(BridgeError::Unsubscribe)?;
        inner.subscriptions.remove(&topic);
        debug!(session = %self.id, topic = %topic, "Unsubscribed");

        self.out
            .send(ServerMessage::success_with(ResponseType::Unsubscribe, &topic))
            .await;
        Ok(())
    }

    pub async fn publish(&self, request: PublishRequest) -> Result<(), BridgeError> {
        let inner = self.inner.lock().await;
        let handle = inner
            .link_handle()
            .ok_or(BridgeError::NotConnected(NOT_CONNECTED))?;
        if request.topic.is_empty() {
            return Err(BridgeError::Validation(EMPTY_PUBLISH_TOPIC));
        }
        if request.qos > MAX_QOS {
            return Err(BridgeError::Validation(INVALID_QOS));
        }

        handle
            .publish(
                request.topic.clone(),
                request.message.clone().into_bytes(),
                request.qos,
                request.retain,
            )
            .await
            .map_err(BridgeError::Publish)?;
        drop(inner);

        self.out
            .send(ServerMessage::success_with(ResponseType::Publish, &request))
            .await;
        Ok(())
    }

    /// Tear down the broker link when the control channel goes away.
    pub async fn close(&self) {
        let link = self.inner.lock().await.link.take();
        if let Some(link) = link {
            self.teardown(link).await;
        }
        self.set_state(SessionState::Disconnected);
    }
}

/// Runs on every successful broker (re)connection: confirm the connect, then
/// replay the recorded subscriptions. A failed replay is logged and the
/// remaining topics are still attempted.
async fn on_connected(out: &Outbound, inner: &SessionInner) {
    if let Some(ref m) = out.metrics {
        m.broker_connected();
    }
    out.send(ServerMessage::success(ResponseType::Connect)).await;

    let Some(link) = inner.link.as_ref() else {
        return;
    };
    for (topic, qos) in &inner.subscriptions {
        match link.handle.subscribe(topic.clone(), *qos).await {
            Ok(()) => debug!(session = %out.session_id, topic = %topic, "Subscription replayed"),
            Err(e) => warn!(
                session = %out.session_id,
                topic = %topic,
                "Failed to replay subscription: {}", e
            ),
        }
    }
}

async fn run_event_pump(
    mut events: BrokerEvents,
    inner: Weak<Mutex<SessionInner>>,
    out: Outbound,
) {
    while let Some(event) = events.recv().await {
        match event {
            BrokerEvent::Message(delivery) => out.deliver(delivery).await,
            BrokerEvent::ConnectionLost(reason) => {
                warn!(session = %out.session_id, "MQTT connection lost: {}", reason);
                if let Some(ref m) = out.metrics {
                    m.broker_connection_lost();
                }
                out.send(ServerMessage::error(format!(
                    "{}: {}",
                    CONNECTION_LOST, reason
                )))
                .await;
            }
            BrokerEvent::Connected => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let guard = inner.lock().await;
                info!(session = %out.session_id, "MQTT connection restored");
                on_connected(&out, &guard).await;
            }
        }
    }
    debug!(session = %out.session_id, "Broker event pump ended");
}
