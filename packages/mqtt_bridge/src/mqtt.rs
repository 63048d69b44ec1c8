//! MQTT broker adapter built on `rumqttc`.
//!
//! Each connection gets a driver task that polls the `rumqttc` event loop,
//! matches outgoing requests with their broker acknowledgements, reconnects
//! with a capped exponential backoff and forwards events to the session.

use futures::future::BoxFuture;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Incoming, MqttOptions,
    Outgoing, QoS, SubscribeReasonCode,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{
    BrokerConnector, BrokerError, BrokerEvent, BrokerEvents, BrokerHandle, BrokerOptions,
    Delivery,
};

/// Capacity of the `rumqttc` request channel.
const REQUEST_CAPACITY: usize = 64;

/// First reconnect delay; doubles up to `BrokerOptions::max_reconnect_interval`.
const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);

type AckSender = oneshot::Sender<Result<(), BrokerError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum AckKind {
    Subscribe,
    Unsubscribe,
    Publish,
}

/// Matches requests to acknowledgements.
///
/// Waiters are queued in request order and get a packet id once `rumqttc`
/// reports the outgoing packet; the matching ack resolves them.
#[derive(Default)]
struct AckTracker {
    queued: HashMap<AckKind, VecDeque<AckSender>>,
    inflight: HashMap<(AckKind, u16), AckSender>,
}

impl AckTracker {
    fn enqueue(&mut self, kind: AckKind, tx: AckSender) {
        self.queued.entry(kind).or_default().push_back(tx);
    }

    /// The request left the client with `pkid`. QoS 0 publishes carry pkid 0
    /// and complete on write.
    fn sent(&mut self, kind: AckKind, pkid: u16) {
        let Some(tx) = self.queued.get_mut(&kind).and_then(|q| q.pop_front()) else {
            return;
        };
        if kind == AckKind::Publish && pkid == 0 {
            let _ = tx.send(Ok(()));
        } else {
            self.inflight.insert((kind, pkid), tx);
        }
    }

    /// Drop the most recent waiter when its request never reached the client.
    fn withdraw_last(&mut self, kind: AckKind) {
        if let Some(queue) = self.queued.get_mut(&kind) {
            queue.pop_back();
        }
    }

    fn acked(&mut self, kind: AckKind, pkid: u16, result: Result<(), BrokerError>) {
        if let Some(tx) = self.inflight.remove(&(kind, pkid)) {
            let _ = tx.send(result);
        }
    }

    fn fail_all(&mut self, error: BrokerError) {
        for (_, tx) in self.inflight.drain() {
            let _ = tx.send(Err(error.clone()));
        }
        for (_, queue) in self.queued.drain() {
            for tx in queue {
                let _ = tx.send(Err(error.clone()));
            }
        }
    }
}

struct Shared {
    connected: AtomicBool,
    closing: AtomicBool,
    acks: Mutex<AckTracker>,
}

impl Shared {
    fn with_acks(&self, f: impl FnOnce(&mut AckTracker)) {
        match self.acks.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

/// Opens `rumqttc` connections.
#[derive(Debug, Default, Clone)]
pub struct MqttConnector;

impl MqttConnector {
    pub fn new() -> Self {
        Self
    }
}

impl BrokerConnector for MqttConnector {
    fn connect(
        &self,
        options: BrokerOptions,
    ) -> BoxFuture<'_, Result<(Arc<dyn BrokerHandle>, BrokerEvents), BrokerError>> {
        Box::pin(async move {
            let (handle, events) = MqttHandle::connect(options).await?;
            Ok((Arc::new(handle) as Arc<dyn BrokerHandle>, events))
        })
    }
}

fn mqtt_options(options: &BrokerOptions) -> MqttOptions {
    let mut mqtt_options =
        MqttOptions::new(options.client_id.clone(), options.host.clone(), options.port);
    mqtt_options.set_clean_session(options.clean_session);
    mqtt_options.set_keep_alive(options.keep_alive);
    if let Some((username, password)) = &options.credentials {
        mqtt_options.set_credentials(username.clone(), password.clone());
    }
    mqtt_options
}

fn to_qos(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

fn from_qos(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}

/// Poll until the broker answers the CONNECT.
async fn handshake(eventloop: &mut EventLoop) -> Result<(), BrokerError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    return Ok(());
                }
                return Err(BrokerError::Rejected(format!("{:?}", ack.code)));
            }
            Ok(_) => {}
            Err(ConnectionError::ConnectionRefused(code)) => {
                return Err(BrokerError::Rejected(format!("{:?}", code)));
            }
            Err(e) => return Err(BrokerError::Connection(e.to_string())),
        }
    }
}

pub struct MqttHandle {
    client: AsyncClient,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
    /// Keeps waiter registration and request submission in the same order.
    submit: tokio::sync::Mutex<()>,
    ack_timeout: Duration,
}

impl MqttHandle {
    async fn connect(options: BrokerOptions) -> Result<(Self, BrokerEvents), BrokerError> {
        let (client, mut eventloop) = AsyncClient::new(mqtt_options(&options), REQUEST_CAPACITY);

        match tokio::time::timeout(options.ack_timeout, handshake(&mut eventloop)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(BrokerError::Timeout),
        }
        info!(
            broker = %format!("{}:{}", options.host, options.port),
            client_id = %options.client_id,
            "MQTT connection established"
        );

        let shared = Arc::new(Shared {
            connected: AtomicBool::new(true),
            closing: AtomicBool::new(false),
            acks: Mutex::new(AckTracker::default()),
        });
        let cancel = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let driver = tokio::spawn(drive(
            eventloop,
            shared.clone(),
            events_tx,
            cancel.clone(),
            options.max_reconnect_interval,
        ));

        Ok((
            Self {
                client,
                shared,
                cancel,
                driver: Mutex::new(Some(driver)),
                submit: tokio::sync::Mutex::new(()),
                ack_timeout: options.ack_timeout,
            },
            events_rx,
        ))
    }

    /// Register a waiter, submit the request, then wait for its ack.
    async fn request<F>(&self, kind: AckKind, submit: F) -> Result<(), BrokerError>
    where
        F: Future<Output = Result<(), rumqttc::ClientError>>,
    {
        if !self.is_connected() {
            return Err(BrokerError::Connection("not connected".to_string()));
        }
        let (tx, rx) = oneshot::channel();
        {
            let _order = self.submit.lock().await;
            self.shared.with_acks(|acks| acks.enqueue(kind, tx));
            if let Err(e) = submit.await {
                self.shared.with_acks(|acks| acks.withdraw_last(kind));
                return Err(BrokerError::Connection(e.to_string()));
            }
        }
        match tokio::time::timeout(self.ack_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BrokerError::Closed),
            Err(_) => Err(BrokerError::Timeout),
        }
    }
}

impl BrokerHandle for MqttHandle {
    fn subscribe(&self, topic: String, qos: u8) -> BoxFuture<'_, Result<(), BrokerError>> {
        Box::pin(async move {
            self.request(AckKind::Subscribe, self.client.subscribe(topic, to_qos(qos)))
                .await
        })
    }

    fn unsubscribe(&self, topic: String) -> BoxFuture<'_, Result<(), BrokerError>> {
        Box::pin(async move {
            self.request(AckKind::Unsubscribe, self.client.unsubscribe(topic))
                .await
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
            self.request(
                AckKind::Publish,
                self.client.publish(topic, to_qos(qos), retain, payload),
            )
            .await
        })
    }

    fn disconnect(&self, linger: Duration) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.shared.closing.store(true, Ordering::SeqCst);
            if self.shared.connected.load(Ordering::SeqCst) {
                if let Err(e) = self.client.try_disconnect() {
                    debug!("MQTT disconnect request not queued: {}", e);
                }
            }

            let driver = match self.driver.lock() {
                Ok(mut guard) => guard.take(),
                Err(poisoned) => poisoned.into_inner().take(),
            };
            if let Some(mut driver) = driver {
                if tokio::time::timeout(linger, &mut driver).await.is_err() {
                    debug!("MQTT driver did not finish within linger window, dropping");
                    self.cancel.cancel();
                    driver.abort();
                }
            }
            self.shared.connected.store(false, Ordering::SeqCst);
            self.shared.with_acks(|acks| acks.fail_all(BrokerError::Closed));
        })
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst) && !self.shared.closing.load(Ordering::SeqCst)
    }
}

impl Drop for MqttHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Drive one connection until it is closed or cancelled.
async fn drive(
    mut eventloop: EventLoop,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<BrokerEvent>,
    cancel: CancellationToken,
    max_reconnect_interval: Duration,
) {
    let mut delay = INITIAL_RECONNECT_DELAY.min(max_reconnect_interval);

    loop {
        let polled = tokio::select! {
            _ = cancel.cancelled() => break,
            polled = eventloop.poll() => polled,
        };

        match polled {
            Ok(Event::Incoming(incoming)) => match incoming {
                Incoming::ConnAck(ack) => {
                    if ack.code == ConnectReturnCode::Success {
                        delay = INITIAL_RECONNECT_DELAY.min(max_reconnect_interval);
                        if !shared.connected.swap(true, Ordering::SeqCst) {
                            info!("MQTT connection re-established");
                            let _ = events.send(BrokerEvent::Connected);
                        }
                    }
                }
                Incoming::Publish(publish) => {
                    let _ = events.send(BrokerEvent::Message(Delivery {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                        qos: from_qos(publish.qos),
                        retained: publish.retain,
                    }));
                }
                Incoming::SubAck(suback) => {
                    let rejected = suback
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure));
                    let result = if rejected {
                        Err(BrokerError::Rejected("subscription refused".to_string()))
                    } else {
                        Ok(())
                    };
                    shared.with_acks(|acks| acks.acked(AckKind::Subscribe, suback.pkid, result));
                }
                Incoming::UnsubAck(unsuback) => {
                    shared.with_acks(|acks| acks.acked(AckKind::Unsubscribe, unsuback.pkid, Ok(())));
                }
                Incoming::PubAck(puback) => {
                    shared.with_acks(|acks| acks.acked(AckKind::Publish, puback.pkid, Ok(())));
                }
                Incoming::PubComp(pubcomp) => {
                    shared.with_acks(|acks| acks.acked(AckKind::Publish, pubcomp.pkid, Ok(())));
                }
                _ => {}
            },
            Ok(Event::Outgoing(outgoing)) => match outgoing {
                Outgoing::Subscribe(pkid) => {
                    shared.with_acks(|acks| acks.sent(AckKind::Subscribe, pkid));
                }
                Outgoing::Unsubscribe(pkid) => {
                    shared.with_acks(|acks| acks.sent(AckKind::Unsubscribe, pkid));
                }
                Outgoing::Publish(pkid) => {
                    shared.with_acks(|acks| acks.sent(AckKind::Publish, pkid));
                }
                Outgoing::Disconnect => {
                    debug!("MQTT disconnect sent");
                    break;
                }
                _ => {}
            },
            Err(e) => {
                if shared.closing.load(Ordering::SeqCst) {
                    break;
                }
                let reason = e.to_string();
                shared.with_acks(|acks| acks.fail_all(BrokerError::Connection(reason.clone())));
                // Requests already failed above must not be retransmitted on
                // the next (clean) session.
                eventloop.pending.clear();
                if shared.connected.swap(false, Ordering::SeqCst) {
                    warn!("MQTT connection lost: {}", reason);
                    let _ = events.send(BrokerEvent::ConnectionLost(reason));
                } else {
                    debug!("MQTT reconnect failed: {}", reason);
                }

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = (delay * 2).min(max_reconnect_interval);
            }
        }
    }

    shared.connected.store(false, Ordering::SeqCst);
    shared.with_acks(|acks| acks.fail_all(BrokerError::Closed));
    debug!("MQTT driver stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[test]
    fn qos_conversion_round_trips_valid_levels() {
        for level in 0..=2u8 {
            assert_eq!(from_qos(to_qos(level)), level);
        }
    }

    #[test]
    fn mqtt_options_carry_credentials_and_clean_session() {
        let options = BrokerOptions {
            host: "localhost".into(),
            port: 1883,
            client_id: "c1".into(),
            credentials: Some(("user".into(), "secret".into())),
            clean_session: true,
            keep_alive: Duration::from_secs(30),
            max_reconnect_interval: Duration::from_secs(5),
            ack_timeout: Duration::from_secs(10),
        };
        let mqtt = mqtt_options(&options);
        assert_eq!(mqtt.client_id(), "c1");
        assert_eq!(mqtt.broker_address(), ("localhost".to_string(), 1883));
        assert!(mqtt.clean_session());
        assert_eq!(
            mqtt.credentials(),
            Some(("user".to_string(), "secret".to_string()))
        );
    }

    #[tokio::test]
    async fn tracker_resolves_in_request_order() {
        let mut tracker = AckTracker::default();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        tracker.enqueue(AckKind::Subscribe, tx1);
        tracker.enqueue(AckKind::Subscribe, tx2);

        tracker.sent(AckKind::Subscribe, 7);
        tracker.sent(AckKind::Subscribe, 8);
        tracker.acked(AckKind::Subscribe, 8, Err(BrokerError::Rejected("no".into())));
        tracker.acked(AckKind::Subscribe, 7, Ok(()));

        assert_eq!(rx1.await.unwrap(), Ok(()));
        assert_eq!(rx2.await.unwrap(), Err(BrokerError::Rejected("no".into())));
    }

    #[tokio::test]
    async fn tracker_completes_qos0_publish_on_write() {
        let mut tracker = AckTracker::default();
        let (tx, rx) = oneshot::channel();
        tracker.enqueue(AckKind::Publish, tx);
        tracker.sent(AckKind::Publish, 0);
        assert_eq!(rx.await.unwrap(), Ok(()));
        assert!(tracker.inflight.is_empty());
    }

    #[tokio::test]
    async fn tracker_fail_all_reaches_every_waiter() {
        let mut tracker = AckTracker::default();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        tracker.enqueue(AckKind::Unsubscribe, tx1);
        tracker.sent(AckKind::Unsubscribe, 3);
        tracker.enqueue(AckKind::Publish, tx2);

        tracker.fail_all(BrokerError::Closed);
        assert_eq!(rx1.await.unwrap(), Err(BrokerError::Closed));
        assert_eq!(rx2.await.unwrap(), Err(BrokerError::Closed));
    }

    #[test]
    fn tracker_ignores_unknown_acks() {
        let mut tracker = AckTracker::default();
        tracker.sent(AckKind::Subscribe, 1);
        tracker.acked(AckKind::Subscribe, 1, Ok(()));
        assert!(tracker.inflight.is_empty());
    }

    const CONNECT: u8 = 1;
    const PUBLISH: u8 = 3;
    const CONNACK: [u8; 4] = [0x20, 0x02, 0x00, 0x00];

    /// Read one MQTT control packet, returning its type and body.
    async fn read_packet(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
        let first = stream.read_u8().await.ok()?;
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await.ok()?;
            len |= ((byte & 0x7f) as usize) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; len];
        stream.read_exact(&mut body).await.ok()?;
        Some((first >> 4, body))
    }

    fn local_options(port: u16) -> BrokerOptions {
        BrokerOptions {
            host: "127.0.0.1".into(),
            port,
            client_id: "resend-check".into(),
            credentials: None,
            clean_session: true,
            keep_alive: Duration::from_secs(30),
            max_reconnect_interval: Duration::from_millis(100),
            ack_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn failed_publish_is_not_resent_after_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let broker = tokio::spawn(async move {
            // First connection swallows the publish and drops the socket
            let (mut first, _) = listener.accept().await.unwrap();
            assert_eq!(read_packet(&mut first).await.unwrap().0, CONNECT);
            first.write_all(&CONNACK).await.unwrap();
            let first_saw_publish = loop {
                match read_packet(&mut first).await {
                    Some((PUBLISH, _)) => break true,
                    Some(_) => continue,
                    None => break false,
                }
            };
            drop(first);

            let (mut second, _) = listener.accept().await.unwrap();
            assert_eq!(read_packet(&mut second).await.unwrap().0, CONNECT);
            second.write_all(&CONNACK).await.unwrap();
            let mut resent = false;
            while let Ok(Some((kind, _))) =
                tokio::time::timeout(Duration::from_millis(500), read_packet(&mut second)).await
            {
                if kind == PUBLISH {
                    resent = true;
                }
            }
            (first_saw_publish, resent)
        });

        let (handle, mut events) = MqttConnector::new()
            .connect(local_options(port))
            .await
            .unwrap();

        let result = handle
            .publish("ghost/topic".into(), b"boo".to_vec(), 1, false)
            .await;
        assert!(result.is_err());

        let mut reconnected = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_secs(5), events.recv()).await
        {
            if event == BrokerEvent::Connected {
                reconnected = true;
                break;
            }
        }
        assert!(reconnected);

        let (first_saw_publish, resent) = broker.await.unwrap();
        assert!(first_saw_publish);
        assert!(!resent, "failed publish went out again on the new connection");

        handle.disconnect(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn connect_to_unreachable_broker_fails() {
        let options = BrokerOptions {
            host: "127.0.0.1".into(),
            port: 1,
            client_id: "unreachable".into(),
            credentials: None,
            clean_session: true,
            keep_alive: Duration::from_secs(30),
            max_reconnect_interval: Duration::from_secs(5),
            ack_timeout: Duration::from_secs(5),
        };
        let result = MqttConnector::new().connect(options).await;
        assert!(result.is_err());
    }
}
