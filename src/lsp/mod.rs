//! Language client core: transport, launcher and session

pub mod client;
pub mod codec;
pub mod events;
pub mod jsonrpc;
pub mod launcher;
pub mod process;
pub mod rpc;
pub mod selector;
pub mod transport;

pub use client::{ClientOptions, ClientSession, SessionGuard, SessionState};
pub use events::{EventSink, LoggingSink, SessionEvent};
pub use launcher::{
    ServerConnection, ServerConnector, ServerDescriptor, ServerLauncher, ServerMode,
    ServerOptions,
};
pub use process::{ExitInfo, ProcessHandle};
pub use selector::{DocumentEvent, DocumentFilter, DocumentSelector};
pub use transport::{MessageChannel, PreparedTransport, TransportConfig};
