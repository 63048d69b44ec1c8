//! WebSocket Handler
//!
//! Control channel loop: one session per socket, commands processed in
//! arrival order, all outbound frames funnelled through a single writer.

use axum::extract::ws::{Message, WebSocket};
use futures::{sink::SinkExt, stream::StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::BrokerConnector;
use crate::config::SessionConfig;
use crate::metrics::ServerMetrics;

use super::dispatch::{ConnectionContext, dispatch_binary, dispatch_frame};
use super::protocol::ServerMessage;
use super::registry::SessionRegistry;
use super::session::Session;

/// Handle a browser control channel until it closes.
pub async fn handle_bridge_ws(
    socket: WebSocket,
    registry: Arc<SessionRegistry>,
    connector: Arc<dyn BrokerConnector>,
    session_config: SessionConfig,
    server_metrics: Option<Arc<ServerMetrics>>,
    shutdown: CancellationToken,
) {
    let session_id = uuid::Uuid::new_v4().to_string();
    info!(session = %session_id, "New control channel connection");

    if let Some(ref m) = server_metrics {
        m.connection_opened();
    }

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Channel for sending messages to the WebSocket
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(session_config.send_channel_capacity);

    let session = Arc::new(Session::new(
        session_id.clone(),
        tx,
        connector,
        session_config,
        server_metrics.clone(),
    ));
    registry.register(session.clone()).await;

    // Task to send messages to WebSocket
    let metrics_sender = server_metrics.clone();
    let sender_session = session_id.clone();
    let sender_task = async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    error!("Failed to serialize message: {}", e);
                    continue;
                }
            };
            if let Err(e) = ws_sender.send(Message::Text(json.into())).await {
                debug!(session = %sender_session, "WebSocket write failed: {}", e);
                if let Some(ref m) = metrics_sender {
                    m.websocket_error();
                }
                break;
            }
            if let Some(ref m) = metrics_sender {
                m.message_sent();
            }
        }
    };

    // Task to handle incoming messages
    let ctx = ConnectionContext::new(session.clone(), server_metrics.clone());
    let metrics_input = server_metrics.clone();
    let input_task = async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => dispatch_frame(&ctx, text.as_str()).await,
                Ok(Message::Binary(data)) => dispatch_binary(&ctx, &data).await,
                Ok(Message::Close(_)) => {
                    debug!("Client closed connection");
                    break;
                }
                Err(e) => {
                    warn!("WebSocket error: {}", e);
                    if let Some(ref m) = metrics_input {
                        m.websocket_error();
                    }
                    break;
                }
                _ => {}
            }
        }
    };

    tokio::select! {
        _ = sender_task => debug!("Sender task ended"),
        _ = input_task => debug!("Input task ended"),
        _ = shutdown.cancelled() => debug!(session = %session_id, "Server shutting down"),
    }

    // Release the broker connection with the channel
    session.close().await;
    registry.unregister(&session_id).await;

    if let Some(ref m) = server_metrics {
        m.connection_closed();
    }
    info!(session = %session_id, "Control channel closed");
}
