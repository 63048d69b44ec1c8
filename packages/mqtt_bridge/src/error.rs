use crate::broker::BrokerError;
use crate::ws::{DecodeError, ServerMessage};

// Human-readable texts surfaced to the browser.
pub const NOT_CONNECTED: &str = "未连接到MQTT代理";
pub const DISCONNECT_NOT_CONNECTED: &str = "未连接";
pub const EMPTY_BROKER: &str = "代理地址不能为空";
pub const INVALID_PORT: &str = "端口格式错误";
pub const EMPTY_SUBSCRIBE_TOPIC: &str = "订阅主题不能为空";
pub const EMPTY_UNSUBSCRIBE_TOPIC: &str = "取消订阅主题不能为空";
pub const EMPTY_PUBLISH_TOPIC: &str = "发布主题不能为空";
pub const INVALID_QOS: &str = "QoS必须为0、1或2";
pub const CONNECTION_LOST: &str = "连接断开";

/// Failure of a single control command.
///
/// Every variant is recoverable: it becomes one error response on the
/// session's channel and the session keeps running.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("{0}")]
    Validation(&'static str),

    #[error("{0}")]
    NotConnected(&'static str),

    #[error("连接失败: {0}")]
    Connect(#[source] BrokerError),

    #[error("订阅失败: {0}")]
    Subscribe(#[source] BrokerError),

    #[error("取消订阅失败: {0}")]
    Unsubscribe(#[source] BrokerError),

    #[error("发布失败: {0}")]
    Publish(#[source] BrokerError),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl BridgeError {
    pub fn to_response(&self) -> ServerMessage {
        ServerMessage::error(self.to_string())
    }
}
