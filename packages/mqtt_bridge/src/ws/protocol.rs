//! WebSocket Protocol Types
//!
//! Wire shapes for the browser control channel. Commands arrive as
//! `{"type": ..., "payload": ...}` envelopes and are decoded in two stages:
//! the envelope first, then the payload according to `type`.

use chrono::{DateTime, Utc};
use serde::de::{self, DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::broker::Delivery;

/// Reported for frames that are not a command envelope at all.
pub const MALFORMED_FRAME: &str = "消息格式错误";
/// Reported for envelopes whose `type` is not a known command.
pub const UNSUPPORTED_TYPE: &str = "不支持的消息类型";

const CONNECT_PAYLOAD: &str = "配置解析错误";
const SUBSCRIBE_PAYLOAD: &str = "订阅信息解析错误";
const UNSUBSCRIBE_PAYLOAD: &str = "取消订阅信息解析错误";
const PUBLISH_PAYLOAD: &str = "发布信息解析错误";

/// Broker connection settings sent with a `connect` command.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectConfig {
    pub broker: String,
    /// Browsers send the port as a string; plain numbers are accepted too.
    #[serde(deserialize_with = "string_or_number")]
    pub port: String,
    #[serde(rename = "clientId")]
    pub client_id: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for ConnectConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectConfig")
            .field("broker", &self.broker)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &if self.password.is_empty() { "" } else { "***" })
            .finish()
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(de::Error::invalid_type(
            de::Unexpected::Other(&other.to_string()),
            &"a port string or number",
        )),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscribeRequest {
    pub topic: String,
    pub qos: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishRequest {
    pub topic: String,
    pub message: String,
    pub qos: u8,
    pub retain: bool,
}

/// A decoded control command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect(ConnectConfig),
    Disconnect,
    Subscribe(SubscribeRequest),
    Unsubscribe(String),
    Publish(PublishRequest),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Connect(_) => "connect",
            Command::Disconnect => "disconnect",
            Command::Subscribe(_) => "subscribe",
            Command::Unsubscribe(_) => "unsubscribe",
            Command::Publish(_) => "publish",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("{}", MALFORMED_FRAME)]
    Malformed,
    #[error("{}", UNSUPPORTED_TYPE)]
    Unsupported(String),
    #[error("{context}: {source}")]
    Payload {
        context: &'static str,
        source: serde_json::Error,
    },
}

/// Outer command envelope; the payload stays opaque until `type` is known.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

/// A `null` or missing payload decodes to the payload's empty value so that
/// field validation reports what is missing.
fn decode_payload<T>(payload: Value, context: &'static str) -> Result<T, DecodeError>
where
    T: DeserializeOwned + Default,
{
    if payload.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(payload).map_err(|source| DecodeError::Payload { context, source })
}

/// Decode one control-channel frame into a command.
pub fn decode_command(frame: &str) -> Result<Command, DecodeError> {
    let envelope: Envelope = serde_json::from_str(frame).map_err(|_| DecodeError::Malformed)?;

    match envelope.kind.as_str() {
        "connect" => Ok(Command::Connect(decode_payload(
            envelope.payload,
            CONNECT_PAYLOAD,
        )?)),
        "disconnect" => Ok(Command::Disconnect),
        "subscribe" => Ok(Command::Subscribe(decode_payload(
            envelope.payload,
            SUBSCRIBE_PAYLOAD,
        )?)),
        "unsubscribe" => Ok(Command::Unsubscribe(decode_payload(
            envelope.payload,
            UNSUBSCRIBE_PAYLOAD,
        )?)),
        "publish" => Ok(Command::Publish(decode_payload(
            envelope.payload,
            PUBLISH_PAYLOAD,
        )?)),
        _ => Err(DecodeError::Unsupported(envelope.kind)),
    }
}

/// `type` field of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    Connect,
    Disconnect,
    Subscribe,
    Unsubscribe,
    Publish,
    Message,
    Error,
}

/// A broker message forwarded to the browser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveredMessage {
    pub topic: String,
    pub message: String,
    pub qos: u8,
    pub retained: bool,
    pub timestamp: DateTime<Utc>,
}

impl DeliveredMessage {
    pub fn from_delivery(delivery: Delivery, timestamp: DateTime<Utc>) -> Self {
        Self {
            message: String::from_utf8_lossy(&delivery.payload).into_owned(),
            topic: delivery.topic,
            qos: delivery.qos,
            retained: delivery.retained,
            timestamp,
        }
    }
}

/// Messages sent FROM the server TO the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    #[serde(rename = "type")]
    pub kind: ResponseType,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServerMessage {
    pub fn success(kind: ResponseType) -> Self {
        Self {
            kind,
            success: true,
            payload: None,
            error: None,
        }
    }

    /// Success response echoing `payload`.
    pub fn success_with<T: Serialize>(kind: ResponseType, payload: &T) -> Self {
        Self {
            kind,
            success: true,
            payload: serde_json::to_value(payload).ok(),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: ResponseType::Error,
            success: false,
            payload: None,
            error: Some(message.into()),
        }
    }

    pub fn delivery(message: &DeliveredMessage) -> Self {
        Self::success_with(ResponseType::Message, message)
    }
}
