//! lsclient - language-agnostic LSP client launcher
//!
//! Picks a transport, launches (or connects to) a language server bundle in
//! run or debug mode, and drives the client side of the session: initialize
//! handshake, document forwarding filtered by a document selector, relaying
//! of diagnostics, and orderly shutdown. Editor hosts bind the session to
//! their activation lifecycle through the `adapter` module.

pub mod adapter;
pub mod config;
pub mod lsp;
pub mod types;

pub use adapter::{ExtensionContext, LanguageClientAdapter, LifecycleAdapter};
pub use config::{ClientConfig, ConfigLoader, ServerLaunchConfig};
pub use lsp::{ClientSession, ServerLauncher, SessionEvent, SessionState};
pub use types::{ClientError, TransportError};
