//! Browser Control Channel
//!
//! One WebSocket per browser session that:
//! - Accepts JSON commands (connect, disconnect, subscribe, unsubscribe, publish)
//! - Owns at most one broker connection on the browser's behalf
//! - Forwards broker deliveries back as `message` responses

mod dispatch;
mod handler;
mod protocol;
mod registry;
mod session;


// Re-export the main types and functions
pub use handler::handle_bridge_ws;
pub use protocol::{DecodeError, ServerMessage};
#[cfg(test)]
pub use protocol::{ConnectConfig, ResponseType};
pub use registry::SessionRegistry;
