use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [broker]
//                    disconnect_linger_ms = 500
//
//   env var:         MQTT_BRIDGE_BROKER__DISCONNECT_LINGER_MS=500
//                    (double underscore = nesting)
//
//   CLI flags override both for the [server] section.

/// Prefix for configuration environment variables.
pub const ENV_PREFIX: &str = "MQTT_BRIDGE_";

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub broker: BrokerFileConfig,
    #[serde(default)]
    pub websocket: WebSocketFileConfig,
}

/// HTTP listener settings (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory of browser assets served at `/`. Nothing is served when unset.
    #[serde(default)]
    pub static_dir: Option<PathBuf>,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            static_dir: None,
        }
    }
}

/// Broker connection tunables (lives under `[broker]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BrokerFileConfig {
    #[serde(default = "default_max_reconnect_interval_secs")]
    pub max_reconnect_interval_secs: u64,
    #[serde(default = "default_disconnect_linger_ms")]
    pub disconnect_linger_ms: u64,
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Broker port used when a connect command leaves the port empty.
    #[serde(default = "default_broker_port")]
    pub default_port: u16,
}

impl Default for BrokerFileConfig {
    fn default() -> Self {
        Self {
            max_reconnect_interval_secs: default_max_reconnect_interval_secs(),
            disconnect_linger_ms: default_disconnect_linger_ms(),
            ack_timeout_secs: default_ack_timeout_secs(),
            keep_alive_secs: default_keep_alive_secs(),
            default_port: default_broker_port(),
        }
    }
}

/// Control channel tunables (lives under `[websocket]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebSocketFileConfig {
    #[serde(default = "default_send_channel_capacity")]
    pub send_channel_capacity: usize,
}

impl Default for WebSocketFileConfig {
    fn default() -> Self {
        Self {
            send_channel_capacity: default_send_channel_capacity(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    9080
}
fn default_max_reconnect_interval_secs() -> u64 {
    5
}
fn default_disconnect_linger_ms() -> u64 {
    250
}
fn default_ack_timeout_secs() -> u64 {
    10
}
fn default_keep_alive_secs() -> u64 {
    30
}
fn default_broker_port() -> u16 {
    1883
}
fn default_send_channel_capacity() -> usize {
    100
}

/// Build a figment that layers: defaults → config.toml (if given) → MQTT_BRIDGE_* env vars.
pub fn load_config(config_path: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let mut figment = Figment::from(Serialized::defaults(FileConfig::default()));
    if let Some(path) = config_path {
        figment = figment.merge(Toml::file(path));
    }
    figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig, used throughout the server)
// =============================================================================

/// Per-session behaviour (runtime view).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// Ceiling for the automatic reconnect backoff.
    pub max_reconnect_interval: Duration,
    /// How long a disconnect waits for in-flight broker I/O.
    pub disconnect_linger: Duration,
    pub ack_timeout: Duration,
    pub keep_alive: Duration,
    pub default_broker_port: u16,
    /// Outbound queue size between a session and its WebSocket writer.
    pub send_channel_capacity: usize,
}

impl SessionConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            max_reconnect_interval: Duration::from_secs(fc.broker.max_reconnect_interval_secs),
            disconnect_linger: Duration::from_millis(fc.broker.disconnect_linger_ms),
            ack_timeout: Duration::from_secs(fc.broker.ack_timeout_secs),
            keep_alive: Duration::from_secs(fc.broker.keep_alive_secs),
            default_broker_port: fc.broker.default_port,
            send_channel_capacity: fc.websocket.send_channel_capacity.max(1),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_file(&FileConfig::default())
    }
}
