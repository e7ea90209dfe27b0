//! Client and server launch configuration

use crate::config::defaults::*;
use crate::lsp::{DocumentFilter, ServerMode, TransportConfig};
use crate::types::ClientError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Where the server bundles live and how to run them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerLaunchConfig {
    pub run_bundle_name: String,
    pub debug_bundle_name: String,
    /// Relative to the installation root unless absolute
    pub bundle_dir: PathBuf,
    /// Interpreter for script bundles; empty executes the bundle directly
    pub runtime: String,
    pub debug_port: u16,
    /// Extra process arguments in debug mode. Unset means the default
    /// debugger flags; an explicit list, even an empty one, is used as is.
    pub debug_extra_args: Option<Vec<String>>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl Default for ServerLaunchConfig {
    fn default() -> Self {
        Self {
            run_bundle_name: DEFAULT_RUN_BUNDLE.to_string(),
            debug_bundle_name: DEFAULT_DEBUG_BUNDLE.to_string(),
            bundle_dir: default_bundle_dir(),
            runtime: DEFAULT_RUNTIME.to_string(),
            debug_port: DEFAULT_DEBUG_PORT,
            debug_extra_args: None,
            cwd: None,
            env: BTreeMap::new(),
        }
    }
}

impl ServerLaunchConfig {
    pub fn bundle_name(&self, mode: ServerMode) -> &str {
        match mode {
            ServerMode::Run => &self.run_bundle_name,
            ServerMode::Debug => &self.debug_bundle_name,
        }
    }

    pub fn extra_args(&self, mode: ServerMode) -> Vec<String> {
        match mode {
            ServerMode::Run => Vec::new(),
            ServerMode::Debug => self
                .debug_extra_args
                .clone()
                .unwrap_or_else(|| default_debug_args(self.debug_port)),
        }
    }

    pub fn runtime(&self) -> Option<&str> {
        Some(self.runtime.trim()).filter(|runtime| !runtime.is_empty())
    }
}

/// Everything needed to build one client session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub name: String,
    pub mode: ServerMode,
    pub transport: TransportConfig,
    pub document_selector: Vec<DocumentFilter>,
    pub server: ServerLaunchConfig,
    pub initialization_options: Option<serde_json::Value>,
    pub handshake_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_CLIENT_NAME.to_string(),
            mode: ServerMode::Run,
            transport: TransportConfig::Ipc,
            document_selector: default_document_selector(),
            server: ServerLaunchConfig::default(),
            initialization_options: None,
            handshake_timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.document_selector.is_empty() {
            return Err(ClientError::Config(
                "document_selector must contain at least one filter".to_string(),
            ));
        }

        for (field, value) in [
            ("run_bundle_name", &self.server.run_bundle_name),
            ("debug_bundle_name", &self.server.debug_bundle_name),
        ] {
            if value.trim().is_empty() {
                return Err(ClientError::Config(format!("server.{} must not be empty", field)));
            }
        }

        for (field, value) in [
            ("handshake_timeout_secs", self.handshake_timeout_secs),
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("request_timeout_secs", self.request_timeout_secs),
            ("shutdown_timeout_secs", self.shutdown_timeout_secs),
        ] {
            if value == 0 {
                return Err(ClientError::Config(format!("{} must be positive", field)));
            }
        }

        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_mode_has_no_extra_args() {
        let config = ServerLaunchConfig::default();
        assert!(config.extra_args(ServerMode::Run).is_empty());
    }

    #[test]
    fn test_debug_args_follow_debug_port() {
        let config = ServerLaunchConfig {
            debug_port: 7001,
            ..Default::default()
        };
        assert_eq!(
            config.extra_args(ServerMode::Debug),
            vec!["--nolazy".to_string(), "--debug=7001".to_string()]
        );
    }

    #[test]
    fn test_explicit_debug_args_used_verbatim() {
        let config = ServerLaunchConfig {
            debug_extra_args: Some(vec![]),
            ..Default::default()
        };
        assert!(config.extra_args(ServerMode::Debug).is_empty());

        let config = ServerLaunchConfig {
            debug_extra_args: Some(vec!["--inspect=9229".to_string()]),
            ..Default::default()
        };
        assert_eq!(config.extra_args(ServerMode::Debug), vec!["--inspect=9229".to_string()]);
    }

    #[test]
    fn test_empty_runtime_means_direct_execution() {
        let config = ServerLaunchConfig {
            runtime: "  ".to_string(),
            ..Default::default()
        };
        assert_eq!(config.runtime(), None);
        assert_eq!(ServerLaunchConfig::default().runtime(), Some("node"));
    }

    #[test]
    fn test_validate_rejects_empty_selector() {
        let config = ClientConfig {
            document_selector: vec![],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ClientError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let config = ClientConfig {
            handshake_timeout_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(ClientConfig::default().validate().is_ok());
    }
}
