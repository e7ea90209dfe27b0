//! Events relayed from a running session to its owner

use crate::lsp::process::ExitInfo;
use lsp_types::{
    LogMessageParams, PublishDiagnosticsParams, RegistrationParams, ShowMessageParams,
    UnregistrationParams,
};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// `textDocument/publishDiagnostics`, passed through unchanged
    Diagnostics(PublishDiagnosticsParams),
    LogMessage(LogMessageParams),
    ShowMessage(ShowMessageParams),
    CapabilityRegistered(RegistrationParams),
    CapabilityUnregistered(UnregistrationParams),
    /// Any other server notification
    Notification { method: String, params: Value },
    /// A message from the server could not be understood
    ProtocolError { message: String },
    /// The server went away while the session was running
    Crashed(ExitInfo),
}

/// Receives session events. Called from the session's supervisor task, so
/// implementations must not block.
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: SessionEvent);
}

impl EventSink for mpsc::UnboundedSender<SessionEvent> {
    fn on_event(&self, event: SessionEvent) {
        if self.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }
}

/// Writes every event to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSink;

impl EventSink for LoggingSink {
    fn on_event(&self, event: SessionEvent) {
        match &event {
            SessionEvent::Crashed(exit) => error!("Language server crashed: {:?}", exit),
            SessionEvent::ProtocolError { message } => warn!("Protocol error: {}", message),
            SessionEvent::Diagnostics(params) => info!(
                "{} diagnostics for {}",
                params.diagnostics.len(),
                params.uri
            ),
            other => debug!("Session event: {:?}", other),
        }
    }
}
