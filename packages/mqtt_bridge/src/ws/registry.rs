//! Session Registry
//!
//! Process-wide index of live sessions. Sessions are independent; the
//! registry only exists so health reporting can count them and shutdown can
//! close every broker link.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::metrics::SessionHealth;

use super::session::{Session, SessionId, SessionState};

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, session: Arc<Session>) {
        self.sessions
            .write()
            .await
            .insert(session.id().to_string(), session);
    }

    pub async fn unregister(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.write().await.remove(id)
    }

    #[cfg(test)]
    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Count live sessions by the state of their broker link.
    pub async fn health(&self) -> SessionHealth {
        let sessions = self.sessions.read().await;
        let mut health = SessionHealth {
            total: sessions.len() as u64,
            ..Default::default()
        };
        for session in sessions.values() {
            match session.state() {
                SessionState::Connecting => health.connecting += 1,
                SessionState::Connected => health.connected += 1,
                SessionState::Disconnected => {}
            }
        }
        health
    }

    /// Remove every session and tear down its broker link.
    pub async fn drain(&self) {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .write()
            .await
            .drain()
            .map(|(_, s)| s)
            .collect();
        if sessions.is_empty() {
            return;
        }
        info!("Closing {} active session(s)", sessions.len());
        futures::future::join_all(sessions.iter().map(|s| s.close())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::test_helpers::{BrokerCall, MockBroker};
    use crate::ws::{ConnectConfig, ServerMessage};
    use tokio::sync::mpsc;

    fn session(
        id: &str,
        broker: &Arc<MockBroker>,
    ) -> (Arc<Session>, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(16);
        let session = Arc::new(Session::new(
            id.to_string(),
            tx,
            broker.connector(),
            SessionConfig::default(),
            None,
        ));
        (session, rx)
    }

    #[tokio::test]
    async fn register_and_unregister() {
        let broker = MockBroker::new();
        let registry = SessionRegistry::new();
        let (a, _rx_a) = session("a", &broker);
        let (b, _rx_b) = session("b", &broker);

        registry.register(a).await;
        registry.register(b).await;
        assert_eq!(registry.len().await, 2);
        assert!(registry.get("a").await.is_some());

        assert!(registry.unregister("a").await.is_some());
        assert!(registry.unregister("a").await.is_none());
        assert!(registry.get("a").await.is_none());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn health_counts_sessions_by_state() {
        let broker = MockBroker::new();
        let registry = SessionRegistry::new();
        let (idle, _rx_idle) = session("idle", &broker);
        let (live, _rx_live) = session("live", &broker);
        live.connect(ConnectConfig {
            broker: "localhost".into(),
            ..Default::default()
        })
        .await
        .unwrap();
        registry.register(idle).await;
        registry.register(live.clone()).await;

        assert_eq!(
            registry.health().await,
            SessionHealth {
                total: 2,
                connecting: 0,
                connected: 1,
            }
        );

        live.disconnect().await.unwrap();
        assert_eq!(registry.health().await.connected, 0);
    }

    #[tokio::test]
    async fn drain_closes_connected_sessions() {
        let broker = MockBroker::new();
        let registry = SessionRegistry::new();
        let (a, _rx) = session("a", &broker);
        a.connect(ConnectConfig {
            broker: "localhost".into(),
            ..Default::default()
        })
        .await
        .unwrap();
        registry.register(a).await;

        registry.drain().await;
        assert_eq!(registry.len().await, 0);
        assert!(!broker.is_connected());
        assert!(
            broker
                .calls()
                .iter()
                .any(|c| matches!(c, BrokerCall::Disconnect(_)))
        );
    }
}
