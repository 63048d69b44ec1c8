use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
};

use crate::AppState;
use crate::ws;

/// Browser control channel - one MQTT session per socket
pub async fn bridge_websocket_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    let registry = state.registry.clone();
    let connector = state.connector.clone();
    let session_config = state.session_config.as_ref().clone();
    let metrics = state.metrics.clone();
    let shutdown = state.shutdown.clone();

    ws.on_upgrade(move |socket| {
        ws::handle_bridge_ws(
            socket,
            registry,
            connector,
            session_config,
            Some(metrics),
            shutdown,
        )
    })
}
