use anyhow::{Context, Result};
use axum::{Router, routing::get};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::{net::SocketAddr, sync::Arc};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::MakeSpan;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

mod broker;
mod config;
mod error;
mod handlers;
mod metrics;
mod mqtt;
#[cfg(test)]
mod test_helpers;
mod ws;

use crate::broker::BrokerConnector;
use crate::config::{FileConfig, SessionConfig};
use crate::metrics::ServerMetrics;
use crate::mqtt::MqttConnector;
use crate::ws::SessionRegistry;

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "mqtt-bridge")]
#[command(about = "Bridge browser WebSocket sessions to MQTT brokers")]
struct Cli {
    /// Port for the web server (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to (overrides config)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Path to a config.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory of browser assets to serve at /
    #[arg(long)]
    static_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

impl Cli {
    /// Apply command-line overrides on top of file/env configuration.
    fn apply(&self, fc: &mut FileConfig) {
        if let Some(port) = self.port {
            fc.server.port = port;
        }
        if let Some(ref host) = self.host {
            fc.server.host = host.clone();
        }
        if let Some(ref dir) = self.static_dir {
            fc.server.static_dir = Some(dir.clone());
        }
    }
}

#[derive(Clone)]
pub(crate) struct AppState {
    /// Live browser sessions
    pub registry: Arc<SessionRegistry>,
    /// Opens broker connections on behalf of sessions
    pub connector: Arc<dyn BrokerConnector>,
    pub session_config: Arc<SessionConfig>,
    /// Server metrics for observability
    pub metrics: Arc<ServerMetrics>,
    /// Cancelled when the server begins shutting down
    pub shutdown: CancellationToken,
}

impl AppState {
    pub(crate) fn new(connector: Arc<dyn BrokerConnector>, session_config: SessionConfig) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new()),
            connector,
            session_config: Arc::new(session_config),
            metrics: Arc::new(ServerMetrics::new()),
            shutdown: CancellationToken::new(),
        }
    }
}

pub(crate) fn build_router(state: AppState, static_dir: Option<&Path>) -> Router {
    let mut app = Router::new()
        .route("/ws", get(handlers::bridge_websocket_handler))
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .route("/metrics", get(handlers::metrics_handler));

    if let Some(dir) = static_dir {
        app = app.fallback_service(ServeDir::new(dir));
    }

    app.layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_directive = if cli.debug {
        "mqtt_bridge=debug,tower_http=debug,info"
    } else {
        "mqtt_bridge=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let mut file_config: FileConfig = config::load_config(cli.config.as_deref())
        .extract()
        .context("Failed to load configuration")?;
    cli.apply(&mut file_config);

    let session_config = SessionConfig::from_file(&file_config);
    info!(
        "Broker defaults: port {}, reconnect backoff up to {}s, disconnect linger {}ms",
        session_config.default_broker_port,
        session_config.max_reconnect_interval.as_secs(),
        session_config.disconnect_linger.as_millis()
    );

    let state = AppState::new(Arc::new(MqttConnector::new()), session_config);
    let registry_for_shutdown = state.registry.clone();
    let shutdown_token = state.shutdown.clone();

    let static_dir = file_config.server.static_dir.as_deref();
    if let Some(dir) = static_dir {
        if !dir.is_dir() {
            warn!("Static directory {} does not exist", dir.display());
        }
        info!("Serving static assets from {}", dir.display());
    }
    let app = build_router(state, static_dir);

    let addr = format!("{}:{}", file_config.server.host, file_config.server.port)
        .parse::<SocketAddr>()
        .context("Invalid listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let actual_addr = listener.local_addr()?;

    info!("MQTT bridge listening on http://{}", actual_addr);
    info!("Control channel: ws://{}/ws", actual_addr);

    // Create shutdown signal handler
    let shutdown_signal = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, closing sessions...");
        shutdown_token.cancel();
    };

    // Run server with graceful shutdown
    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error");

    // Sessions still registered at this point lose their broker links here
    registry_for_shutdown.drain().await;

    info!("Shutdown complete");
    server_result
}
