//! Configuration for lsclient
//!
//! `ClientConfig` describes one language client: its server bundles, the
//! transport, the document selector and timeouts. It is loaded from TOML by
//! `ConfigLoader` and falls back to the built-in HOCON defaults.

pub mod defaults;
mod launch;
mod loader;

pub use launch::{ClientConfig, ServerLaunchConfig};
pub use loader::{ConfigLoader, CONFIG_ENV_VAR, PROJECT_CONFIG_FILE};
