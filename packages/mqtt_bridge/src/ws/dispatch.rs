//! Command dispatcher.
//!
//! Decodes one inbound frame and routes it to the session. Every failure
//! becomes exactly one error response; nothing here ends the connection.

use std::sync::Arc;
use tracing::debug;

use crate::error::BridgeError;
use crate::metrics::ServerMetrics;

use super::protocol::{Command, DecodeError, decode_command};
use super::session::Session;

/// Per-connection context shared between the transport layer and the dispatcher.
pub(crate) struct ConnectionContext {
    pub session: Arc<Session>,
    pub metrics: Option<Arc<ServerMetrics>>,
}

impl ConnectionContext {
    pub(crate) fn new(session: Arc<Session>, metrics: Option<Arc<ServerMetrics>>) -> Self {
        Self { session, metrics }
    }
}

/// Handle a single inbound text frame.
pub(crate) async fn dispatch_frame(ctx: &ConnectionContext, frame: &str) {
    if let Some(ref m) = ctx.metrics {
        m.command_received();
    }

    let result = match decode_command(frame) {
        Ok(command) => run_command(&ctx.session, command).await,
        Err(e) => Err(BridgeError::from(e)),
    };
    report(ctx, result).await;
}

/// Handle a binary frame. Commands are text, so only valid UTF-8 is decoded.
pub(crate) async fn dispatch_binary(ctx: &ConnectionContext, frame: &[u8]) {
    match std::str::from_utf8(frame) {
        Ok(text) => dispatch_frame(ctx, text).await,
        Err(_) => {
            if let Some(ref m) = ctx.metrics {
                m.command_received();
            }
            report(ctx, Err(BridgeError::Decode(DecodeError::Malformed))).await;
        }
    }
}

async fn report(ctx: &ConnectionContext, result: Result<(), BridgeError>) {
    if let Err(e) = result {
        debug!(session = %ctx.session.id(), "Command failed: {}", e);
        ctx.session.send_error(&e).await;
    }
}

async fn run_command(session: &Session, command: Command) -> Result<(), BridgeError> {
    debug!(session = %session.id(), command = command.name(), "Dispatching command");
    match command {
        Command::Connect(config) => session.connect(config).await,
        Command::Disconnect => session.disconnect().await,
        Command::Subscribe(request) => session.subscribe(request).await,
        Command::Unsubscribe(topic) => session.unsubscribe(topic).await,
        Command::Publish(request) => session.publish(request).await,
    }
}
